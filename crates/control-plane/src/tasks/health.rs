use std::time::Duration;

use futures_util::{stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::config::HealthMonitorConfig;
use crate::directory::ServerDirectory;
use crate::error::FleetError;
use crate::failover::FailoverCoordinator;
use crate::notify::{DynNotifier, OperatorAlert};
use crate::peers::{DynPeerApi, HealthProbe};
use crate::persistence::{health as health_store, HealthStatus, ServerRecord};
use crate::Result;

#[derive(Debug, Default)]
pub struct HealthSweepReport {
    pub checked: usize,
    pub online: usize,
    pub degraded: usize,
    pub offline: usize,
    /// Failover runs spawned by this sweep. Dropping a handle detaches the run.
    pub failovers: Vec<JoinHandle<()>>,
}

/// Everything a health observation may act on.
#[derive(Clone)]
pub struct HealthContext {
    pub directory: ServerDirectory,
    pub failover: FailoverCoordinator,
    pub notifier: DynNotifier,
    pub config: HealthMonitorConfig,
    pub shutdown: CancellationToken,
}

impl HealthContext {
    pub fn from_state(state: &AppState) -> Self {
        Self {
            directory: state.directory.clone(),
            failover: state.failover.clone(),
            notifier: state.notifier.clone(),
            config: state.health.clone(),
            shutdown: state.shutdown.clone(),
        }
    }
}

pub async fn health_loop(state: AppState) {
    if !state.health.enabled {
        info!("health monitor disabled");
        return;
    }
    let ctx = HealthContext::from_state(&state);
    let sweep_interval = Duration::from_secs(state.health.sweep_interval_secs.max(1));
    let mut interval = tokio::time::interval(sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match run_health_sweep(&ctx, &state.peers).await {
            Ok(report) => {
                if report.offline > 0 || !report.failovers.is_empty() {
                    info!(
                        checked = report.checked,
                        offline = report.offline,
                        failovers = report.failovers.len(),
                        "health sweep finished"
                    );
                }
            }
            Err(err) => warn!(?err, "health sweep failed"),
        }
    }
}

/// Probes every active server concurrently and records the results.
pub async fn run_health_sweep(ctx: &HealthContext, peers: &DynPeerApi) -> Result<HealthSweepReport> {
    let servers = ctx.directory.list_active(true).await?;
    let probes: Vec<(ServerRecord, HealthProbe)> = stream::iter(servers)
        .map(|server| {
            let peers = peers.clone();
            async move {
                let probe = peers.check_health(&server).await;
                (server, probe)
            }
        })
        .buffer_unordered(ctx.config.max_concurrency.max(1))
        .collect()
        .await;

    let mut report = HealthSweepReport::default();
    for (server, probe) in probes {
        report.checked += 1;
        match probe.status {
            HealthStatus::Online => report.online += 1,
            HealthStatus::Degraded => report.degraded += 1,
            HealthStatus::Offline => report.offline += 1,
        }
        match apply_observation(ctx, &server, &probe).await {
            Ok(Some(handle)) => report.failovers.push(handle),
            Ok(None) => {}
            Err(err) => warn!(server = %server.name, ?err, "health observation not recorded"),
        }
    }
    Ok(report)
}

/// Records one observation. An offline server that stays offline for the
/// configured number of checks and still hosts active devices gets a failover
/// run on its own task.
pub async fn apply_observation(
    ctx: &HealthContext,
    server: &ServerRecord,
    probe: &HealthProbe,
) -> Result<Option<JoinHandle<()>>> {
    let previous = ctx
        .directory
        .update_health_status(
            server.id,
            probe.status,
            probe.response_time_ms,
            probe.detail.as_deref(),
        )
        .await?;

    if probe.status != HealthStatus::Offline {
        return Ok(None);
    }
    if previous != HealthStatus::Offline {
        warn!(server = %server.name, detail = ?probe.detail, "server went offline");
        let alert = OperatorAlert::ServerOffline {
            server_id: server.id,
            server_name: server.name.clone(),
        };
        if let Err(err) = ctx.notifier.notify_operator(&alert).await {
            warn!(?err, "offline alert delivery failed");
        }
    }

    if !ctx.config.failover_on_offline || ctx.failover.is_running(server.id) {
        return Ok(None);
    }
    let threshold = ctx.config.offline_checks_before_failover.max(1);
    if !health_store::consecutive_offline(ctx.directory.db(), server.id, threshold).await? {
        return Ok(None);
    }
    if ctx.directory.active_device_count(server.id).await? == 0 {
        return Ok(None);
    }
    if ctx.failover.still_without_backup(server.id).await? {
        debug!(server = %server.name, "still no backup server, failover not retried");
        return Ok(None);
    }

    let failover = ctx.failover.clone();
    let cancel = ctx.shutdown.child_token();
    let server_id = server.id;
    let server_name = server.name.clone();
    info!(server = %server_name, "starting failover for offline server");
    Ok(Some(tokio::spawn(async move {
        match failover.handle_server_failure_with(server_id, cancel).await {
            Ok(_) => {}
            Err(FleetError::FailoverInProgress { .. }) => {}
            Err(err) => warn!(server = %server_name, %err, "failover did not complete"),
        }
    })))
}
