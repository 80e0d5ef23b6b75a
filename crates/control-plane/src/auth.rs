use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, Request},
    middleware::Next,
};
use metrics::counter;
use tracing::warn;

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
    telemetry,
};

pub async fn require_operator_auth(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> ApiResult<axum::response::Response> {
    let request_id = telemetry::request_id_from_request(&req);
    let path = format!("{} {}", req.method(), req.uri().path());
    let token = match extract_bearer_from_header(
        req.headers(),
        &state.operator_auth.header_name,
        "operator authorization header",
    ) {
        Ok(token) => token,
        Err(err) => {
            log_auth_failure(request_id.as_deref(), &path, &err.message);
            return Err(err);
        }
    };

    if !state.operator_auth.is_operator_token(&token) {
        log_auth_failure(request_id.as_deref(), &path, "invalid operator token");
        return Err(AppError::forbidden("invalid operator token"));
    }

    Ok(next.run(req).await)
}

pub fn extract_bearer_from_header(
    headers: &HeaderMap,
    header: &HeaderName,
    context: &str,
) -> ApiResult<String> {
    let value = headers
        .get(header)
        .ok_or_else(|| AppError::unauthorized(format!("missing {context}")))?;

    let value = value
        .to_str()
        .map_err(|_| AppError::unauthorized(format!("invalid {context}")))?;

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(AppError::unauthorized(format!("invalid {context} scheme")));
    };

    Ok(token.trim().to_string())
}

fn log_auth_failure(request_id: Option<&str>, path: &str, reason: &str) {
    counter!("fleet_auth_failures_total").increment(1);
    warn!(request_id, path, reason, "operator authentication failed");
}
