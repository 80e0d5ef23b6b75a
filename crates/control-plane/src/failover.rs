//! Moving every active device off a failed server.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ::metrics::{counter, histogram};
use common::api;
use futures_util::{stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::FailoverConfig;
use crate::directory::ServerDirectory;
use crate::error::{FleetError, FleetResult};
use crate::lifecycle::PeerLifecycleManager;
use crate::notify::{DynNotifier, OperatorAlert};
use crate::persistence::{
    devices as device_store, failover_log, DeviceStatus, FailoverStatus, ServerRecord,
};
use crate::selector::ServerSelector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverSummary {
    pub failed_server: String,
    pub backup_server: String,
    pub migrated: u32,
    pub failed: u32,
    pub skipped: u32,
    pub outcome: FailoverStatus,
}

impl FailoverSummary {
    pub fn to_api(&self) -> api::FailoverSummaryResponse {
        api::FailoverSummaryResponse {
            failed_server: self.failed_server.clone(),
            backup_server: self.backup_server.clone(),
            migrated: self.migrated,
            failed: self.failed,
            skipped: self.skipped,
            outcome: self.outcome.into(),
        }
    }

    fn details(&self) -> String {
        let mut details = format!("Migrated {} devices, {} failed", self.migrated, self.failed);
        if self.skipped > 0 {
            details.push_str(&format!(", {} skipped", self.skipped));
        }
        details
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceOutcome {
    Migrated,
    Failed,
    Skipped,
}

type RunningSet = Arc<Mutex<HashSet<Uuid>>>;

/// Marks a server as having a failover in flight until dropped.
struct RunGuard {
    running: RunningSet,
    server_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut running = match self.running.lock() {
            Ok(running) => running,
            Err(poisoned) => poisoned.into_inner(),
        };
        running.remove(&self.server_id);
    }
}

#[derive(Clone)]
pub struct FailoverCoordinator {
    directory: ServerDirectory,
    selector: ServerSelector,
    lifecycle: PeerLifecycleManager,
    notifier: DynNotifier,
    config: FailoverConfig,
    running: RunningSet,
}

impl FailoverCoordinator {
    pub fn new(
        directory: ServerDirectory,
        selector: ServerSelector,
        lifecycle: PeerLifecycleManager,
        notifier: DynNotifier,
        config: FailoverConfig,
    ) -> Self {
        Self {
            directory,
            selector,
            lifecycle,
            notifier,
            config,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_running(&self, server_id: Uuid) -> bool {
        match self.running.lock() {
            Ok(running) => running.contains(&server_id),
            Err(poisoned) => poisoned.into_inner().contains(&server_id),
        }
    }

    fn begin(&self, server_id: Uuid) -> FleetResult<RunGuard> {
        let mut running = match self.running.lock() {
            Ok(running) => running,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !running.insert(server_id) {
            return Err(FleetError::FailoverInProgress { server_id });
        }
        Ok(RunGuard {
            running: Arc::clone(&self.running),
            server_id,
        })
    }

    pub async fn handle_server_failure(&self, server_id: Uuid) -> FleetResult<FailoverSummary> {
        self.handle_server_failure_with(server_id, CancellationToken::new())
            .await
    }

    /// Migrates the active devices of `server_id` to a backup. Stops starting
    /// new migrations once `cancel` fires or the run deadline passes.
    pub async fn handle_server_failure_with(
        &self,
        server_id: Uuid,
        cancel: CancellationToken,
    ) -> FleetResult<FailoverSummary> {
        let _guard = self.begin(server_id)?;
        let failed = self.directory.get(server_id).await?;
        let started = Instant::now();

        let Some(backup) = self.selector.find_backup_server(server_id).await? else {
            return self.no_backup(&failed).await;
        };

        let devices = device_store::list_devices_for_server(
            self.directory.db(),
            server_id,
            Some(DeviceStatus::Active),
        )
        .await?;
        info!(
            server = %failed.name,
            backup = %backup.name,
            devices = devices.len(),
            "failover started"
        );

        let deadline = started + self.config.run_timeout();
        let outcomes: Vec<DeviceOutcome> = stream::iter(devices)
            .map(|device| {
                let lifecycle = self.lifecycle.clone();
                let cancel = cancel.clone();
                let backup_id = backup.id;
                async move {
                    if cancel.is_cancelled() || Instant::now() >= deadline {
                        return DeviceOutcome::Skipped;
                    }
                    match lifecycle.migrate(device.id, backup_id).await {
                        Ok(_) => DeviceOutcome::Migrated,
                        Err(err) => {
                            warn!(device_id = %device.id, %err, "device migration failed during failover");
                            DeviceOutcome::Failed
                        }
                    }
                }
            })
            .buffer_unordered(self.config.max_parallel_migrations.max(1))
            .collect()
            .await;

        let count = |wanted: DeviceOutcome| {
            outcomes.iter().filter(|outcome| **outcome == wanted).count() as u32
        };
        let skipped = count(DeviceOutcome::Skipped);
        let summary = FailoverSummary {
            failed_server: failed.name.clone(),
            backup_server: backup.name.clone(),
            migrated: count(DeviceOutcome::Migrated),
            failed: count(DeviceOutcome::Failed),
            skipped,
            outcome: if skipped > 0 {
                FailoverStatus::Cancelled
            } else {
                FailoverStatus::Completed
            },
        };

        failover_log::append(
            self.directory.db(),
            failed.id,
            Some(backup.id),
            summary.outcome,
            &summary.details(),
        )
        .await?;

        let alert = OperatorAlert::FailoverFinished {
            server_id: failed.id,
            server_name: failed.name.clone(),
            backup_name: backup.name.clone(),
            migrated: summary.migrated,
            failed: summary.failed,
            skipped: summary.skipped,
        };
        if let Err(err) = self.notifier.notify_operator(&alert).await {
            warn!(?err, "failover alert delivery failed");
        }

        counter!("fleet_failovers_total", "outcome" => outcome_label(summary.outcome)).increment(1);
        histogram!("fleet_failover_duration_seconds").record(started.elapsed().as_secs_f64());
        info!(
            server = %failed.name,
            backup = %backup.name,
            migrated = summary.migrated,
            failed = summary.failed,
            skipped = summary.skipped,
            "failover finished"
        );
        Ok(summary)
    }

    /// True when the latest run for `server_id` found no backup and there is
    /// still none to move its devices to.
    pub async fn still_without_backup(&self, server_id: Uuid) -> FleetResult<bool> {
        let latest = failover_log::list_entries(self.directory.db(), Some(server_id), 1).await?;
        match latest.first() {
            Some(entry) if entry.status == FailoverStatus::NoBackup => {
                Ok(self.selector.find_backup_server(server_id).await?.is_none())
            }
            _ => Ok(false),
        }
    }

    async fn no_backup(&self, failed: &ServerRecord) -> FleetResult<FailoverSummary> {
        warn!(server = %failed.name, "no backup server available for failover");
        failover_log::append(
            self.directory.db(),
            failed.id,
            None,
            FailoverStatus::NoBackup,
            "No backup server available",
        )
        .await?;
        let alert = OperatorAlert::NoBackupAvailable {
            server_id: failed.id,
            server_name: failed.name.clone(),
        };
        if let Err(err) = self.notifier.notify_operator(&alert).await {
            warn!(?err, "no-backup alert delivery failed");
        }
        counter!("fleet_failovers_total", "outcome" => outcome_label(FailoverStatus::NoBackup))
            .increment(1);
        Err(FleetError::NoBackupAvailable {
            server_id: failed.id,
        })
    }
}

fn outcome_label(status: FailoverStatus) -> &'static str {
    match status {
        FailoverStatus::Completed => "completed",
        FailoverStatus::NoBackup => "no_backup",
        FailoverStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lifecycle::DeviceParams;
    use crate::persistence::{devices as device_store, NewServer};
    use crate::test_support::{wg_key, TestFleet};

    async fn provision_on(fleet: &TestFleet, n: u8, ip: Option<&str>) -> crate::persistence::DeviceRecord {
        fleet
            .lifecycle
            .provision(
                &fleet.user(i64::from(n)),
                DeviceParams {
                    name: format!("device-{n}"),
                    public_key: wg_key(n),
                    assigned_ip: ip.map(str::to_string),
                },
            )
            .await
            .expect("provision")
    }

    #[tokio::test]
    async fn devices_move_to_backup_and_keep_their_address() {
        let fleet = TestFleet::new().await;
        let a = fleet.server("a", 10).await;
        let device = provision_on(&fleet, 7, Some("10.8.0.5")).await;
        let b = fleet.server("b", 10).await;
        fleet.peers.set_unreachable(a.id, true);

        let summary = fleet.failover.handle_server_failure(a.id).await.expect("failover");

        assert_eq!(summary.migrated, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.outcome, FailoverStatus::Completed);
        assert_eq!(summary.backup_server, "b");
        assert_eq!(fleet.peers.allowed_ips_of(b.id, &wg_key(7)).as_deref(), Some("10.8.0.5/32"));
        let stored = fleet.lifecycle.device(device.id).await.expect("device");
        assert_eq!(stored.server_id, b.id);
        assert_eq!(fleet.load_of(a.id).await, 0);
        assert_eq!(fleet.load_of(b.id).await, 1);

        let log = failover_log::list_entries(&fleet.db, Some(a.id), 10).await.expect("log");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].details, "Migrated 1 devices, 0 failed");
        assert_eq!(log[0].to_server_id, Some(b.id));
        assert!(matches!(
            fleet.notifier.alerts().last(),
            Some(OperatorAlert::FailoverFinished { migrated: 1, .. })
        ));
    }

    #[tokio::test]
    async fn partial_failures_are_counted_and_logged() {
        let fleet = TestFleet::new().await;
        let a = fleet.server("a", 10).await;
        for n in 1..=3 {
            provision_on(&fleet, n, None).await;
        }
        fleet.server("b", 10).await;
        fleet.peers.reject_key(&wg_key(2));

        let summary = fleet.failover.handle_server_failure(a.id).await.expect("failover");

        assert_eq!((summary.migrated, summary.failed, summary.skipped), (2, 1, 0));
        let log = failover_log::list_entries(&fleet.db, Some(a.id), 10).await.expect("log");
        assert_eq!(log[0].details, "Migrated 2 devices, 1 failed");
        let left = device_store::list_devices_for_server(&fleet.db, a.id, None)
            .await
            .expect("left");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].public_key, wg_key(2));
    }

    #[tokio::test]
    async fn no_backup_is_logged_and_alerted() {
        let fleet = TestFleet::new().await;
        let a = fleet.server("a", 10).await;
        provision_on(&fleet, 1, None).await;
        let mut owned = NewServer::new("owned", "10.0.0.9", 10);
        owned.dedicated_user_email = Some("owner@example.com".into());
        fleet.directory.create(owned).await.expect("dedicated");

        let err = fleet.failover.handle_server_failure(a.id).await.expect_err("no backup");

        assert!(matches!(err, FleetError::NoBackupAvailable { .. }));
        let log = failover_log::list_entries(&fleet.db, Some(a.id), 10).await.expect("log");
        assert_eq!(log[0].status, FailoverStatus::NoBackup);
        assert_eq!(log[0].to_server_id, None);
        assert!(matches!(
            fleet.notifier.alerts().as_slice(),
            [OperatorAlert::NoBackupAvailable { .. }]
        ));
        assert!(!fleet.failover.is_running(a.id));
    }

    #[tokio::test]
    async fn inactive_devices_stay_behind() {
        let fleet = TestFleet::new().await;
        let a = fleet.server("a", 10).await;
        let active = provision_on(&fleet, 1, None).await;
        let parked = provision_on(&fleet, 2, None).await;
        device_store::update_device_status(&fleet.db, parked.id, DeviceStatus::Inactive)
            .await
            .expect("park");
        let b = fleet.server("b", 10).await;

        let summary = fleet.failover.handle_server_failure(a.id).await.expect("failover");

        assert_eq!(summary.migrated, 1);
        assert_eq!(fleet.lifecycle.device(active.id).await.expect("a").server_id, b.id);
        assert_eq!(fleet.lifecycle.device(parked.id).await.expect("p").server_id, a.id);
    }

    #[tokio::test]
    async fn migrations_run_with_bounded_parallelism() {
        let mut fleet = TestFleet::new().await;
        fleet.set_failover_config(FailoverConfig {
            max_parallel_migrations: 2,
            run_timeout_secs: 60,
        });
        let a = fleet.server("a", 20).await;
        for n in 0..6 {
            provision_on(&fleet, n, None).await;
        }
        fleet.server("b", 20).await;
        fleet.peers.set_delay(Duration::from_millis(20));

        let summary = fleet.failover.handle_server_failure(a.id).await.expect("failover");

        assert_eq!(summary.migrated, 6);
        let peak = fleet.peers.max_in_flight();
        assert!(peak >= 1 && peak <= 2, "peak concurrency {peak}");
    }

    #[tokio::test]
    async fn cancellation_stops_new_migrations() {
        let mut fleet = TestFleet::new().await;
        fleet.set_failover_config(FailoverConfig {
            max_parallel_migrations: 1,
            run_timeout_secs: 60,
        });
        let a = fleet.server("a", 10).await;
        for n in 1..=4 {
            provision_on(&fleet, n, None).await;
        }
        fleet.server("b", 10).await;
        let cancel = CancellationToken::new();
        fleet.notifier.cancel_on_change(cancel.clone());

        let summary = fleet
            .failover
            .handle_server_failure_with(a.id, cancel)
            .await
            .expect("failover");

        assert_eq!((summary.migrated, summary.skipped), (1, 3));
        assert_eq!(summary.outcome, FailoverStatus::Cancelled);
        let log = failover_log::list_entries(&fleet.db, Some(a.id), 10).await.expect("log");
        assert_eq!(log[0].details, "Migrated 1 devices, 0 failed, 3 skipped");
    }

    #[tokio::test]
    async fn concurrent_runs_for_one_server_are_refused() {
        let fleet = TestFleet::new().await;
        let a = fleet.server("a", 10).await;
        fleet.server("b", 10).await;

        let guard = fleet.failover.begin(a.id).expect("first run");
        let err = fleet.failover.handle_server_failure(a.id).await.expect_err("second run");
        assert!(matches!(err, FleetError::FailoverInProgress { .. }));

        drop(guard);
        let summary = fleet.failover.handle_server_failure(a.id).await.expect("after release");
        assert_eq!(summary.migrated, 0);
    }
}
