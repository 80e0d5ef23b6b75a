pub mod app_state;
pub mod auth;
pub mod client_config;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod failover;
pub mod http;
pub mod ipam;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod peers;
pub mod persistence;
pub mod selector;
pub mod tasks;
pub mod telemetry;
pub mod version;

#[cfg(test)]
pub(crate) mod test_support;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_state::{AppState, StateDeps};
use crate::credentials::{DbCredentialStore, DynCredentialStore};
use crate::metrics::{init_metrics_recorder, record_build_info};
use crate::peers::{http::HttpPeerApi, DynPeerApi};

/// Boot the control plane and serve until SIGTERM or Ctrl+C.
pub async fn run() -> Result<()> {
    run_with_shutdown(shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = init_metrics_recorder();

    let db_pool = persistence::migrations::init_pool(&app_config.database.url).await?;
    let migration_outcome = persistence::migrations::run_migrations(&db_pool).await?;
    if migration_outcome.applied.is_empty() {
        info!(
            current_version = migration_outcome.snapshot.latest_applied,
            target_version = migration_outcome.snapshot.latest_available,
            "database schema is up to date"
        );
    } else {
        for mig in &migration_outcome.applied {
            info!(
                version = mig.version,
                description = mig.description,
                "applied database migration"
            );
        }
    }
    record_build_info(&migration_outcome.snapshot);

    let credentials: DynCredentialStore = Arc::new(DbCredentialStore::new(db_pool.clone()));
    let peers: DynPeerApi = Arc::new(HttpPeerApi::new(&app_config.peer_api, credentials)?);
    let notifier = notify::from_config(&app_config.notifications)?;
    let cancel = CancellationToken::new();

    let state = AppState::build(
        db_pool,
        &app_config,
        StateDeps {
            peers,
            notifier,
            metrics_handle,
            schema: migration_outcome.snapshot,
            shutdown: cancel.clone(),
        },
    )?;

    let mut background = Vec::new();
    background.push(tokio::spawn(tasks::health::health_loop(state.clone())));
    background.push(tokio::spawn(tasks::retention::health_retention_loop(
        state.db.clone(),
        state.retention.clone(),
        cancel.clone(),
    )));
    background.push(tokio::spawn(tasks::bandwidth::bandwidth_loop(state.clone())));

    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;

    let app: Router = http::build_router(state.clone()).with_state(state);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    info!(%api_addr, "control-plane listening");

    let serve_cancel = cancel.clone();
    let served = axum::serve(api_listener, make_service)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown => {}
                _ = serve_cancel.cancelled() => {}
            }
        })
        .await;

    cancel.cancel();
    for task in background {
        if let Err(err) = task.await {
            error!(%err, "background task panicked");
        }
    }

    served.map_err(|err| anyhow::anyhow!("control-plane server failed: {err}"))
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<Option<()>>().await
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}
