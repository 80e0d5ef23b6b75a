use std::sync::Arc;

use axum::http::HeaderName;
use metrics_exporter_prometheus::PrometheusHandle;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{AppConfig, BandwidthConfig, HealthMonitorConfig, RetentionConfig},
    credentials::DbCredentialStore,
    directory::ServerDirectory,
    failover::FailoverCoordinator,
    ipam::AddressPool,
    lifecycle::PeerLifecycleManager,
    notify::DynNotifier,
    peers::DynPeerApi,
    persistence,
    selector::ServerSelector,
};

/// Shared application state passed into handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    pub directory: ServerDirectory,
    pub selector: ServerSelector,
    pub lifecycle: PeerLifecycleManager,
    pub failover: FailoverCoordinator,
    pub peers: DynPeerApi,
    pub credentials: DbCredentialStore,
    pub notifier: DynNotifier,
    pub operator_auth: OperatorAuth,
    pub health: HealthMonitorConfig,
    pub retention: RetentionConfig,
    pub bandwidth: BandwidthConfig,
    pub metrics_handle: PrometheusHandle,
    pub schema: persistence::MigrationSnapshot,
    /// Fires on process shutdown; long-running work derives child tokens from it.
    pub shutdown: CancellationToken,
}

/// Operator authentication configuration.
#[derive(Clone)]
pub struct OperatorAuth {
    pub tokens: Vec<String>,
    pub header_name: HeaderName,
}

impl OperatorAuth {
    pub fn from_config(config: &crate::config::OperatorAuthConfig) -> crate::Result<Self> {
        let tokens: Vec<String> = config
            .tokens
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            anyhow::bail!("FLEET_CP__OPERATOR__TOKENS cannot be empty");
        }
        let header_name = config
            .header_name
            .parse::<HeaderName>()
            .map_err(|err| anyhow::anyhow!("invalid operator header name: {}", err))?;
        Ok(Self {
            tokens,
            header_name,
        })
    }

    pub fn is_operator_token(&self, candidate: &str) -> bool {
        self.tokens.iter().any(|token| {
            if token.len() != candidate.len() {
                return false;
            }
            token.as_bytes().ct_eq(candidate.as_bytes()).into()
        })
    }
}

/// External collaborators the fleet services are wired to.
pub struct StateDeps {
    pub peers: DynPeerApi,
    pub notifier: DynNotifier,
    pub metrics_handle: PrometheusHandle,
    pub schema: persistence::MigrationSnapshot,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn build(db: persistence::Db, config: &AppConfig, deps: StateDeps) -> crate::Result<Self> {
        let operator_auth = OperatorAuth::from_config(&config.operator)?;
        let directory = ServerDirectory::new(db.clone(), &config.selection, config.bandwidth.clone());
        let selector = ServerSelector::new(directory.clone());
        let addresses = AddressPool::new(db.clone(), config.ipam.network()?);
        let lifecycle = PeerLifecycleManager::new(
            directory.clone(),
            selector.clone(),
            Arc::clone(&deps.peers),
            Arc::clone(&deps.notifier),
            addresses,
        );
        let failover = FailoverCoordinator::new(
            directory.clone(),
            selector.clone(),
            lifecycle.clone(),
            Arc::clone(&deps.notifier),
            config.failover.clone(),
        );

        Ok(Self {
            credentials: DbCredentialStore::new(db.clone()),
            db,
            directory,
            selector,
            lifecycle,
            failover,
            peers: deps.peers,
            notifier: deps.notifier,
            operator_auth,
            health: config.health.clone(),
            retention: config.retention.clone(),
            bandwidth: config.bandwidth.clone(),
            metrics_handle: deps.metrics_handle,
            schema: deps.schema,
            shutdown: deps.shutdown,
        })
    }
}
