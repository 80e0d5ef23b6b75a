use super::*;
use axum::routing::{get, post};

pub fn router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/v1/devices", get(list_devices).post(create_device))
        .route("/api/v1/devices/{device_id}", get(get_device).delete(delete_device))
        .route("/api/v1/devices/{device_id}/migrate", post(migrate_device))
        .route("/api/v1/devices/{device_id}/config", get(device_config))
        .route_layer(middleware::from_fn_with_state(state, require_operator_auth))
}
