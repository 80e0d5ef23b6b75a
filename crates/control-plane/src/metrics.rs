use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    extract::MatchedPath,
    http::{Request, Response as HttpResponse},
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower::{Layer, Service};
use tracing::warn;

static METRICS_HANDLE: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();

/// Installs the global Prometheus recorder once and returns its handle.
pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder =
                PrometheusBuilder::new().add_global_label("app_version", crate::version::VERSION);
            match builder.install_recorder() {
                Ok(handle) => handle,
                Err(err) => {
                    // Another recorder owns the process; render an empty registry.
                    warn!(%err, "metrics recorder not installed");
                    PrometheusBuilder::new().build_recorder().handle()
                }
            }
        })
        .clone()
}

pub fn record_build_info(snapshot: &crate::persistence::MigrationSnapshot) {
    let schema_version = snapshot
        .latest_applied
        .map(|v| v.to_string())
        .unwrap_or_else(|| "none".to_string());

    gauge!(
        "fleet_control_plane_info",
        "version" => crate::version::VERSION,
        "git_sha" => crate::version::GIT_SHA,
        "schema_version" => schema_version
    )
    .set(1.0);
    gauge!("fleet_schema_version").set(snapshot.latest_applied.unwrap_or_default() as f64);
    gauge!("fleet_migrations_pending").set(snapshot.pending.len() as f64);
}

/// Counts unexpected failures by their outermost cause.
pub fn record_internal_error(err: &anyhow::Error) {
    let kind = if err
        .chain()
        .any(|cause| cause.downcast_ref::<sqlx::Error>().is_some())
    {
        "database"
    } else if err
        .chain()
        .any(|cause| cause.downcast_ref::<reqwest::Error>().is_some())
    {
        "http_client"
    } else {
        "other"
    };
    counter!("fleet_internal_errors_total", "kind" => kind).increment(1);
}

/// Middleware layer that records HTTP request metrics.
#[derive(Clone, Default)]
pub struct HttpMetricsLayer;

impl<S> Layer<S> for HttpMetricsLayer {
    type Service = HttpMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpMetricsService { inner }
    }
}

#[derive(Clone)]
pub struct HttpMetricsService<S> {
    inner: S,
}

impl<S, B, ResBody> Service<Request<B>> for HttpMetricsService<S>
where
    S: Service<Request<B>, Response = HttpResponse<ResBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let method = req.method().to_string();
        // Unmatched paths share one label.
        let path = req
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_owned())
            .unwrap_or_else(|| "unmatched".to_string());
        let start = Instant::now();
        let fut = self.inner.call(req);

        Box::pin(async move {
            let result = fut.await;
            let latency = start.elapsed().as_secs_f64();
            if let Ok(response) = &result {
                counter!(
                    "fleet_http_requests_total",
                    "method" => method.clone(),
                    "path" => path.clone(),
                    "status" => response.status().as_u16().to_string()
                )
                .increment(1);
                histogram!(
                    "fleet_http_request_duration_seconds",
                    "method" => method,
                    "path" => path
                )
                .record(latency);
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_are_classified_by_cause() {
        init_metrics_recorder();
        record_internal_error(&anyhow::Error::new(sqlx::Error::PoolTimedOut));
        let rendered = init_metrics_recorder().render();
        assert!(rendered.contains("fleet_internal_errors_total"));
        assert!(rendered.contains("kind=\"database\""));
    }
}
