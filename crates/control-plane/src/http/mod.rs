use crate::{
    app_state::AppState,
    auth::require_operator_auth,
    error::{ApiResult, AppError},
    lifecycle::DeviceParams,
    metrics::HttpMetricsLayer,
    persistence::{failover_log, AccessLevel, NewServer},
    selector::Subscriber,
    tasks::health::{apply_observation, HealthContext},
};
use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    middleware,
    response::IntoResponse,
    Json, Router,
};
use common::api;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;
use uuid::Uuid;

mod devices;
mod error_mapper;
mod failovers;
mod servers;
mod system;

const DEFAULT_HISTORY_LIMIT: u32 = 100;
const MAX_HISTORY_LIMIT: u32 = 1_000;
const DEFAULT_FAILOVER_LOG_LIMIT: u32 = 50;
const MAX_FAILOVER_LOG_LIMIT: u32 = 500;

pub fn build_router(state: AppState) -> Router<AppState> {
    let middleware_stack = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(HttpMetricsLayer);
    Router::<AppState>::new()
        .merge(system::router(state.clone()))
        .merge(servers::router(state.clone()))
        .merge(devices::router(state.clone()))
        .merge(failovers::router(state))
        .layer(middleware_stack)
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub built_at: &'static str,
    pub schema_version: Option<i64>,
    pub target_schema_version: Option<i64>,
    pub pending_migrations: usize,
}

pub(crate) async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            version: crate::version::VERSION,
            git_sha: crate::version::GIT_SHA,
            built_at: crate::version::BUILD_TIMESTAMP,
            schema_version: state.schema.latest_applied,
            target_schema_version: state.schema.latest_available,
            pending_migrations: state.schema.pending.len(),
        }),
    )
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

fn clamp_limit(limit: Option<u32>, default: u32, max: u32) -> ApiResult<u32> {
    match limit {
        None => Ok(default),
        Some(0) => Err(AppError::bad_request("limit must be greater than zero")),
        Some(value) => Ok(value.min(max)),
    }
}

fn optional_trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn new_server_from_request(req: &api::ServerCreateRequest) -> NewServer {
    let mut new_server = NewServer::new(req.name.trim(), req.address.trim(), i64::from(req.max_users));
    new_server.location = req.location.trim().to_string();
    new_server.country_code = optional_trimmed(req.country_code.clone()).map(|c| c.to_ascii_uppercase());
    if let Some(port) = req.api_port {
        new_server.api_port = port;
    }
    if let Some(port) = req.wg_port {
        new_server.wg_port = port;
    }
    new_server.wg_public_key = optional_trimmed(req.wg_public_key.clone());
    new_server.dns = optional_trimmed(req.dns.clone());
    new_server.provider = optional_trimmed(req.provider.clone());
    new_server.bandwidth_cap_bytes = req.bandwidth_cap_bytes;
    new_server.access_level = req.access_level.map(AccessLevel::from).unwrap_or(AccessLevel::Public);
    new_server.is_visible = req.is_visible.unwrap_or(true);
    new_server.vip_email = optional_trimmed(req.vip_email.clone());
    new_server.dedicated_user_email = optional_trimmed(req.dedicated_user_email.clone());
    new_server.port_forwarding_allowed = req.port_forwarding_allowed.unwrap_or(false);
    new_server
}

pub(crate) async fn create_server(
    State(state): State<AppState>,
    Json(req): Json<api::ServerCreateRequest>,
) -> ApiResult<(StatusCode, Json<api::ServerResponse>)> {
    if let Some(key) = optional_trimmed(req.wg_public_key.clone()) {
        crate::lifecycle::validate_public_key(&key)?;
    }
    let server = state.directory.create(new_server_from_request(&req)).await?;
    if let Some(secret) = optional_trimmed(req.api_secret.clone()) {
        state.credentials.store(server.id, &secret).await?;
    }
    Ok((StatusCode::CREATED, Json(server.to_api())))
}

pub(crate) async fn list_servers(
    State(state): State<AppState>,
    Query(query): Query<api::ServerListQuery>,
) -> ApiResult<Json<Vec<api::ServerResponse>>> {
    if let Some(location) = query.location.as_deref() {
        let found = state.directory.find_by_location(location).await?;
        return Ok(Json(found.iter().map(|s| s.to_api()).collect()));
    }
    let servers = if query.include_inactive {
        state
            .directory
            .list_all()
            .await?
            .into_iter()
            .filter(|server| query.include_hidden || server.is_visible)
            .collect()
    } else {
        state.directory.list_active(query.include_hidden).await?
    };
    Ok(Json(servers.iter().map(|s| s.to_api()).collect()))
}

pub(crate) async fn get_server(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<api::ServerResponse>> {
    let server = state.directory.get(server_id).await?;
    Ok(Json(server.to_api()))
}

pub(crate) async fn deactivate_server(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<api::ServerResponse>> {
    let server = state.directory.deactivate(server_id).await?;
    Ok(Json(server.to_api()))
}

pub(crate) async fn put_credential(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
    Json(req): Json<api::CredentialRequest>,
) -> ApiResult<StatusCode> {
    let secret = req.api_secret.trim();
    if secret.is_empty() {
        return Err(AppError::bad_request("api_secret cannot be empty"));
    }
    state.directory.get(server_id).await?;
    state.credentials.store(server_id, secret).await?;
    info!(%server_id, "server credential updated");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn server_stats(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<api::ServerStatsResponse>> {
    let stats = state.directory.stats(server_id).await?;
    Ok(Json(stats.to_api()))
}

pub(crate) async fn health_history(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
    Query(query): Query<api::LimitQuery>,
) -> ApiResult<Json<Vec<api::HealthCheckResponse>>> {
    let limit = clamp_limit(query.limit, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT)?;
    state.directory.get(server_id).await?;
    let checks = state.directory.health_history(server_id, limit).await?;
    Ok(Json(checks.iter().map(|c| c.to_api()).collect()))
}

/// Records an externally observed health status, with the same alerting and
/// failover rules as the periodic sweep.
pub(crate) async fn report_health(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
    Json(req): Json<api::HealthReportRequest>,
) -> ApiResult<Json<api::ServerResponse>> {
    let server = state.directory.get(server_id).await?;
    let probe = crate::peers::HealthProbe {
        status: req.status.into(),
        response_time_ms: req.response_time_ms,
        detail: optional_trimmed(req.detail),
    };
    let ctx = HealthContext::from_state(&state);
    if apply_observation(&ctx, &server, &probe).await?.is_some() {
        info!(server = %server.name, "failover scheduled from health report");
    }
    let server = state.directory.get(server_id).await?;
    Ok(Json(server.to_api()))
}

pub(crate) async fn server_peers(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<api::ServerPeersResponse>> {
    let server = state.directory.get(server_id).await?;
    let peers = state.peers.list_peers(&server).await?;
    Ok(Json(api::ServerPeersResponse { server_id, peers }))
}

pub(crate) async fn reconcile_server(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<api::ReconcileResponse>> {
    let report = state.lifecycle.reconcile(server_id).await?;
    Ok(Json(api::ReconcileResponse {
        server_id,
        missing_on_remote: report.missing_on_remote,
        unknown_on_remote: report.unknown_on_remote,
    }))
}

pub(crate) async fn server_bandwidth(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<api::BandwidthUsageResponse>> {
    let usage = state.directory.bandwidth_usage(server_id).await?;
    Ok(Json(usage.to_api()))
}

pub(crate) async fn report_bandwidth(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
    Json(req): Json<api::BandwidthReportRequest>,
) -> ApiResult<Json<api::BandwidthUsageResponse>> {
    let usage = state
        .directory
        .record_bandwidth(server_id, req.bytes_sent, req.bytes_received)
        .await?;
    Ok(Json(usage.to_api()))
}

pub(crate) async fn bandwidth_report(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<api::BandwidthUsageResponse>>> {
    let report = state.directory.bandwidth_report().await?;
    Ok(Json(report.iter().map(|u| u.to_api()).collect()))
}

pub(crate) async fn reset_bandwidth(
    State(state): State<AppState>,
) -> ApiResult<Json<api::BandwidthResetResponse>> {
    let servers_reset = state.directory.reset_bandwidth_counters().await?;
    Ok(Json(api::BandwidthResetResponse { servers_reset }))
}

pub(crate) async fn trigger_failover(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<Json<api::FailoverSummaryResponse>> {
    let summary = state
        .failover
        .handle_server_failure_with(server_id, state.shutdown.child_token())
        .await?;
    Ok(Json(summary.to_api()))
}

pub(crate) async fn list_failovers(
    State(state): State<AppState>,
    Query(query): Query<api::FailoverLogQuery>,
) -> ApiResult<Json<Vec<api::FailoverLogResponse>>> {
    let limit = clamp_limit(query.limit, DEFAULT_FAILOVER_LOG_LIMIT, MAX_FAILOVER_LOG_LIMIT)?;
    let entries = failover_log::list_entries(&state.db, query.server_id, limit).await?;
    Ok(Json(entries.iter().map(|e| e.to_api()).collect()))
}

pub(crate) async fn select_server(
    State(state): State<AppState>,
    Json(req): Json<api::SelectionRequest>,
) -> ApiResult<Json<api::SelectionResponse>> {
    let subscriber = Subscriber {
        user_id: req.user_id,
        email: req.email.trim().to_string(),
        is_vip: req.vip,
    };
    let selection = state.selector.select(&subscriber).await?;
    Ok(Json(api::SelectionResponse {
        server: selection.server.to_api(),
        reason: selection.reason.as_str().to_string(),
    }))
}

pub(crate) async fn create_device(
    State(state): State<AppState>,
    Json(req): Json<api::DeviceCreateRequest>,
) -> ApiResult<(StatusCode, Json<api::DeviceResponse>)> {
    let subscriber = Subscriber {
        user_id: req.user_id,
        email: req.email.trim().to_string(),
        is_vip: req.vip,
    };
    let device = state
        .lifecycle
        .provision(
            &subscriber,
            DeviceParams {
                name: req.name,
                public_key: req.public_key,
                assigned_ip: optional_trimmed(req.assigned_ip),
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(device.to_api())))
}

pub(crate) async fn list_devices(
    State(state): State<AppState>,
    Query(query): Query<api::DeviceListQuery>,
) -> ApiResult<Json<Vec<api::DeviceResponse>>> {
    let devices = state.lifecycle.devices_for_user(query.user_id).await?;
    Ok(Json(devices.iter().map(|d| d.to_api()).collect()))
}

pub(crate) async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> ApiResult<Json<api::DeviceResponse>> {
    let device = state.lifecycle.device(device_id).await?;
    Ok(Json(device.to_api()))
}

pub(crate) async fn delete_device(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.lifecycle.deprovision(device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn migrate_device(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
    Json(req): Json<api::MigrateDeviceRequest>,
) -> ApiResult<Json<api::DeviceResponse>> {
    let device = state.lifecycle.migrate(device_id, req.server_id).await?;
    Ok(Json(device.to_api()))
}

pub(crate) async fn device_config(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> ApiResult<Json<api::ClientConfigResponse>> {
    let config = state.lifecycle.client_config(device_id).await?;
    Ok(Json(api::ClientConfigResponse { device_id, config }))
}
