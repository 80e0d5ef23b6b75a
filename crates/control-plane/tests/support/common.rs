#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request as HttpRequest, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::api;
use control_plane::{
    app_state::{AppState, StateDeps},
    config::{
        AppConfig, BandwidthConfig, DatabaseConfig, FailoverConfig, HealthMonitorConfig,
        IpamConfig, NotificationConfig, OperatorAuthConfig, PeerApiConfig, RetentionConfig,
        SelectionConfig, ServerConfig,
    },
    credentials::{DbCredentialStore, DynCredentialStore},
    http::build_router,
    metrics::{init_metrics_recorder, record_build_info},
    notify::LogNotifier,
    peers::http::HttpPeerApi,
    persistence::migrations,
};
use http_body_util::BodyExt;
use httpmock::MockServer;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const TEST_OPERATOR_TOKEN: &str = "test-operator-token";
pub const TEST_NODE_SECRET: &str = "node-secret";

pub fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        database: DatabaseConfig {
            url: "sqlite::memory:".into(),
        },
        operator: OperatorAuthConfig {
            tokens: vec![TEST_OPERATOR_TOKEN.into()],
            header_name: "authorization".into(),
        },
        peer_api: PeerApiConfig {
            scheme: "http".into(),
            connect_timeout_secs: 1,
            health_timeout_secs: 1,
            request_timeout_secs: 2,
            ..PeerApiConfig::default()
        },
        health: HealthMonitorConfig {
            enabled: false,
            ..HealthMonitorConfig::default()
        },
        failover: FailoverConfig::default(),
        selection: SelectionConfig::default(),
        ipam: IpamConfig::default(),
        retention: RetentionConfig::default(),
        notifications: NotificationConfig::default(),
        bandwidth: BandwidthConfig::default(),
    }
}

pub async fn setup_app() -> (Router, AppState) {
    let config = test_config();
    let db = migrations::init_pool(&config.database.url)
        .await
        .expect("db init");
    let migration_outcome = migrations::run_migrations(&db).await.expect("migrations");
    let metrics_handle = init_metrics_recorder();
    record_build_info(&migration_outcome.snapshot);

    let credentials: DynCredentialStore = Arc::new(DbCredentialStore::new(db.clone()));
    let peers = HttpPeerApi::new(&config.peer_api, credentials).expect("peer client");
    let state = AppState::build(
        db,
        &config,
        StateDeps {
            peers: Arc::new(peers),
            notifier: Arc::new(LogNotifier),
            metrics_handle,
            schema: migration_outcome.snapshot,
            shutdown: CancellationToken::new(),
        },
    )
    .expect("state");
    let app = build_router(state.clone()).with_state(state.clone());
    (app, state)
}

/// A deterministic, valid WireGuard public key.
pub fn wg_key(seed: u8) -> String {
    STANDARD.encode([seed; 32])
}

pub fn operator_request(method: &str, uri: &str, body: Option<Value>) -> HttpRequest<Body> {
    let builder = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_OPERATOR_TOKEN}"));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn send(app: &Router, request: HttpRequest<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}

/// Registers a server whose management API is `node`.
pub async fn register_server(
    app: &Router,
    node: &MockServer,
    name: &str,
    max_users: u32,
) -> api::ServerResponse {
    let (status, body) = send(
        app,
        operator_request(
            "POST",
            "/api/v1/servers",
            Some(serde_json::json!({
                "name": name,
                "location": format!("{name} city"),
                "address": "127.0.0.1",
                "api_port": node.port(),
                "wg_public_key": wg_key(200),
                "max_users": max_users,
                "api_secret": TEST_NODE_SECRET,
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register {name}: {body}");
    serde_json::from_value(body).expect("server response")
}

pub async fn provision(app: &Router, user_id: i64, key: &str) -> (StatusCode, Value) {
    send(
        app,
        operator_request(
            "POST",
            "/api/v1/devices",
            Some(serde_json::json!({
                "user_id": user_id,
                "email": format!("user{user_id}@example.com"),
                "name": "laptop",
                "public_key": key,
            })),
        ),
    )
    .await
}
