use super::*;
use axum::routing::{get, post};

pub fn router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/v1/servers/{server_id}/failover", post(trigger_failover))
        .route("/api/v1/failovers", get(list_failovers))
        .route_layer(middleware::from_fn_with_state(state, require_operator_auth))
}
