#[path = "support/common.rs"]
mod common;

use ::common::api::{
    ClientConfigResponse, DeviceResponse, FailoverLogResponse, FailoverOutcome,
    FailoverSummaryResponse, ServerResponse,
};
use axum::body::Body;
use axum::http::{Request as HttpRequest, StatusCode};
use common::{
    operator_request, provision, register_server, send, setup_app, wg_key, TEST_NODE_SECRET,
};
use httpmock::prelude::*;
use serde_json::json;
use tower::ServiceExt;

fn accept_peers(node: &MockServer) -> (httpmock::Mock<'_>, httpmock::Mock<'_>) {
    let add = node.mock(|when, then| {
        when.method(POST)
            .path("/api/add-peer")
            .header("X-API-Secret", TEST_NODE_SECRET);
        then.status(200).json_body(json!({ "success": true }));
    });
    let remove = node.mock(|when, then| {
        when.method(POST)
            .path("/api/remove-peer")
            .header("X-API-Secret", TEST_NODE_SECRET);
        then.status(200).json_body(json!({ "success": true }));
    });
    (add, remove)
}

#[tokio::test]
async fn health_is_public_and_reports_schema() {
    let (app, _state) = setup_app().await;

    let (status, body) = send(
        &app,
        HttpRequest::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["pending_migrations"], json!(0));
    assert_eq!(body["version"], json!(control_plane::version::VERSION));
}

#[tokio::test]
async fn operator_routes_require_a_valid_token() {
    let (app, _state) = setup_app().await;

    let missing = app
        .clone()
        .oneshot(
            HttpRequest::builder()
                .uri("/api/v1/servers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        HttpRequest::builder()
            .uri("/api/v1/servers")
            .header("authorization", "Bearer wrong-token")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], json!("forbidden"));

    let (status, body) = send(&app, operator_request("GET", "/api/v1/servers", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn metrics_endpoint_reports_http_requests() {
    let (app, _state) = setup_app().await;
    let _ = send(&app, operator_request("GET", "/api/v1/servers", None)).await;

    let (status, body) = send(&app, operator_request("GET", "/metrics", None)).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap_or_default().to_string();
    assert!(
        text.contains("fleet_http_requests_total") && text.contains("/api/v1/servers"),
        "metrics payload missing http counters: {text}"
    );
}

#[tokio::test]
async fn servers_can_be_registered_listed_and_deactivated() {
    let (app, _state) = setup_app().await;
    let node = MockServer::start();
    let server = register_server(&app, &node, "edge-a", 25).await;
    assert_eq!(server.current_users, 0);
    assert!(!server.dedicated);

    let (status, body) = send(
        &app,
        operator_request("GET", &format!("/api/v1/servers/{}", server.id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], json!("edge-a"));

    let (status, body) = send(
        &app,
        operator_request("GET", "/api/v1/servers?location=edge-a%20city", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    let (status, body) = send(
        &app,
        operator_request(
            "POST",
            &format!("/api/v1/servers/{}/deactivate", server.id),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_active"], json!(false));

    let (_, active) = send(&app, operator_request("GET", "/api/v1/servers", None)).await;
    assert_eq!(active, json!([]));
    let (_, all) = send(
        &app,
        operator_request("GET", "/api/v1/servers?include_inactive=true", None),
    )
    .await;
    assert_eq!(all.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn invalid_server_registration_is_rejected() {
    let (app, _state) = setup_app().await;
    let (status, body) = send(
        &app,
        operator_request(
            "POST",
            "/api/v1/servers",
            Some(json!({
                "name": "edge",
                "location": "Paris",
                "address": "127.0.0.1",
                "max_users": 10,
                "wg_public_key": "not-a-key",
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("bad_request"));
}

#[tokio::test]
async fn full_server_is_skipped_when_provisioning() {
    let (app, _state) = setup_app().await;
    let node_a = MockServer::start();
    let node_b = MockServer::start();
    let (add_a, _) = accept_peers(&node_a);
    let (add_b, _) = accept_peers(&node_b);
    let a = register_server(&app, &node_a, "edge-a", 1).await;
    let b = register_server(&app, &node_b, "edge-b", 10).await;

    let (status, first) = provision(&app, 1, &wg_key(1)).await;
    assert_eq!(status, StatusCode::CREATED, "{first}");
    let first: DeviceResponse = serde_json::from_value(first).unwrap();
    assert_eq!(first.server_id, a.id);

    let (status, second) = provision(&app, 2, &wg_key(2)).await;
    assert_eq!(status, StatusCode::CREATED, "{second}");
    let second: DeviceResponse = serde_json::from_value(second).unwrap();
    assert_eq!(second.server_id, b.id);

    add_a.assert_hits(1);
    add_b.assert_hits(1);

    let (_, a_now) = send(
        &app,
        operator_request("GET", &format!("/api/v1/servers/{}", a.id), None),
    )
    .await;
    let a_now: ServerResponse = serde_json::from_value(a_now).unwrap();
    assert_eq!(a_now.current_users, 1);
}

#[tokio::test]
async fn device_lifecycle_over_http() {
    let (app, _state) = setup_app().await;
    let node = MockServer::start();
    let (add, remove) = accept_peers(&node);
    register_server(&app, &node, "edge-a", 10).await;

    let (status, created) = provision(&app, 7, &wg_key(7)).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let device: DeviceResponse = serde_json::from_value(created).unwrap();
    add.assert_hits(1);

    let (status, listed) = send(
        &app,
        operator_request("GET", "/api/v1/devices?user_id=7", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let (status, config) = send(
        &app,
        operator_request("GET", &format!("/api/v1/devices/{}/config", device.id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let config: ClientConfigResponse = serde_json::from_value(config).unwrap();
    assert!(config.config.contains(&format!("Address = {}/32", device.assigned_ip)));
    assert!(config.config.contains("Endpoint = 127.0.0.1:51820"));
    assert!(config.config.contains(&format!("PublicKey = {}", wg_key(200))));

    let (status, _) = send(
        &app,
        operator_request("DELETE", &format!("/api/v1/devices/{}", device.id), None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    remove.assert_hits(1);

    let (status, body) = send(
        &app,
        operator_request("GET", &format!("/api/v1/devices/{}", device.id), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], json!("not_found"));
}

#[tokio::test]
async fn rejected_peer_fails_provisioning_without_leaking_load() {
    let (app, _state) = setup_app().await;
    let node = MockServer::start();
    let server = register_server(&app, &node, "edge-a", 10).await;
    node.mock(|when, then| {
        when.method(POST).path("/api/add-peer");
        then.status(500).body("wg set failed");
    });

    let (status, body) = provision(&app, 1, &wg_key(1)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], json!("provision_failed"));

    let (_, server_now) = send(
        &app,
        operator_request("GET", &format!("/api/v1/servers/{}", server.id), None),
    )
    .await;
    assert_eq!(server_now["current_users"], json!(0));
}

#[tokio::test]
async fn bad_keys_and_empty_fleet_are_reported() {
    let (app, _state) = setup_app().await;

    let (status, body) = provision(&app, 1, "short").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("bad_request"));

    let (status, body) = provision(&app, 1, &wg_key(1)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], json!("no_server_available"));

    let (status, body) = send(
        &app,
        operator_request(
            "POST",
            "/api/v1/selection",
            Some(json!({ "user_id": 1, "email": "user1@example.com" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], json!("no_server_available"));
}

#[tokio::test]
async fn failover_moves_devices_to_the_backup() {
    let (app, _state) = setup_app().await;
    let node_a = MockServer::start();
    let node_b = MockServer::start();
    accept_peers(&node_a);
    let a = register_server(&app, &node_a, "edge-a", 10).await;

    let (status, created) = send(
        &app,
        operator_request(
            "POST",
            "/api/v1/devices",
            Some(json!({
                "user_id": 4,
                "email": "user4@example.com",
                "name": "phone",
                "public_key": wg_key(4),
                "assigned_ip": "10.8.0.5",
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let device: DeviceResponse = serde_json::from_value(created).unwrap();
    assert_eq!(device.assigned_ip, "10.8.0.5");

    let add_b = node_b.mock(|when, then| {
        when.method(POST)
            .path("/api/add-peer")
            .body_contains(wg_key(4))
            .body_contains("10.8.0.5/32");
        then.status(200).json_body(json!({ "success": true }));
    });
    let b = register_server(&app, &node_b, "edge-b", 10).await;

    let (status, summary) = send(
        &app,
        operator_request("POST", &format!("/api/v1/servers/{}/failover", a.id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{summary}");
    let summary: FailoverSummaryResponse = serde_json::from_value(summary).unwrap();
    assert_eq!(summary.backup_server, "edge-b");
    assert_eq!((summary.migrated, summary.failed, summary.skipped), (1, 0, 0));
    assert_eq!(summary.outcome, FailoverOutcome::Completed);
    add_b.assert_hits(1);

    let (_, moved) = send(
        &app,
        operator_request("GET", &format!("/api/v1/devices/{}", device.id), None),
    )
    .await;
    assert_eq!(moved["server_id"], json!(b.id));
    assert_eq!(moved["assigned_ip"], json!("10.8.0.5"));

    let (status, log) = send(
        &app,
        operator_request("GET", &format!("/api/v1/failovers?server_id={}", a.id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let log: Vec<FailoverLogResponse> = serde_json::from_value(log).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].to_server_id, Some(b.id));
    assert_eq!(log[0].details, "Migrated 1 devices, 0 failed");
}

#[tokio::test]
async fn failover_without_backup_is_unavailable() {
    let (app, _state) = setup_app().await;
    let node = MockServer::start();
    let a = register_server(&app, &node, "edge-a", 10).await;

    let (status, body) = send(
        &app,
        operator_request("POST", &format!("/api/v1/servers/{}/failover", a.id), None),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], json!("no_backup_available"));

    let (_, log) = send(&app, operator_request("GET", "/api/v1/failovers", None)).await;
    assert_eq!(log[0]["status"], json!("no_backup"));
}

#[tokio::test]
async fn health_reports_and_bandwidth_are_recorded() {
    let (app, _state) = setup_app().await;
    let node = MockServer::start();
    let server = register_server(&app, &node, "edge-a", 10).await;

    let (status, body) = send(
        &app,
        operator_request(
            "POST",
            &format!("/api/v1/servers/{}/health", server.id),
            Some(json!({ "status": "degraded", "response_time_ms": 1800 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["health_status"], json!("degraded"));

    let (_, history) = send(
        &app,
        operator_request("GET", &format!("/api/v1/servers/{}/health", server.id), None),
    )
    .await;
    assert_eq!(history[0]["status"], json!("degraded"));

    let (status, usage) = send(
        &app,
        operator_request(
            "POST",
            &format!("/api/v1/servers/{}/bandwidth", server.id),
            Some(json!({ "bytes_sent": 1024, "bytes_received": 1024 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["used_bytes"], json!(2048));
    assert_eq!(usage["status"], json!("ok"));

    let (_, report) = send(&app, operator_request("GET", "/api/v1/bandwidth", None)).await;
    assert_eq!(report, json!([]));

    let (status, reset) = send(&app, operator_request("POST", "/api/v1/bandwidth/reset", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reset["servers_reset"], json!(1));
}

#[tokio::test]
async fn reconcile_reports_drift_between_rows_and_node() {
    let (app, _state) = setup_app().await;
    let node = MockServer::start();
    accept_peers(&node);
    let server = register_server(&app, &node, "edge-a", 10).await;
    let (status, _) = provision(&app, 1, &wg_key(1)).await;
    assert_eq!(status, StatusCode::CREATED);

    node.mock(|when, then| {
        when.method(GET).path("/api/list-peers");
        then.status(200)
            .json_body(json!({ "peers": [{ "public_key": wg_key(9) }] }));
    });

    let (status, body) = send(
        &app,
        operator_request("GET", &format!("/api/v1/servers/{}/reconcile", server.id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["missing_on_remote"], json!([wg_key(1)]));
    assert_eq!(body["unknown_on_remote"], json!([wg_key(9)]));
}
