use super::*;
use axum::routing::{get, post, put};

pub fn router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/v1/servers", get(list_servers).post(create_server))
        .route("/api/v1/servers/{server_id}", get(get_server))
        .route("/api/v1/servers/{server_id}/deactivate", post(deactivate_server))
        .route("/api/v1/servers/{server_id}/credential", put(put_credential))
        .route("/api/v1/servers/{server_id}/stats", get(server_stats))
        .route(
            "/api/v1/servers/{server_id}/health",
            get(health_history).post(report_health),
        )
        .route("/api/v1/servers/{server_id}/peers", get(server_peers))
        .route("/api/v1/servers/{server_id}/reconcile", get(reconcile_server))
        .route(
            "/api/v1/servers/{server_id}/bandwidth",
            get(server_bandwidth).post(report_bandwidth),
        )
        .route("/api/v1/bandwidth", get(bandwidth_report))
        .route("/api/v1/bandwidth/reset", post(reset_bandwidth))
        .route("/api/v1/selection", post(select_server))
        .route_layer(middleware::from_fn_with_state(state, require_operator_auth))
}
