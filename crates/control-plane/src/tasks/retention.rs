use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::persistence::{self as db, health as health_store};
use crate::Result;

pub async fn health_retention_loop(db: db::Db, retention: RetentionConfig, shutdown: CancellationToken) {
    let sweep_interval = retention.cleanup_interval_secs.max(60);
    let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match run_health_retention_sweep(&db, &retention, Utc::now()).await {
            Ok(0) => {}
            Ok(pruned) => {
                info!(pruned, "health retention sweep removed checks");
            }
            Err(err) => warn!(?err, "health retention sweep failed"),
        }
    }
}

pub(crate) async fn run_health_retention_sweep(
    db: &db::Db,
    retention: &RetentionConfig,
    now: DateTime<Utc>,
) -> Result<u64> {
    if retention.health_check_secs == 0 {
        return Ok(0);
    }

    let cutoff =
        now - ChronoDuration::seconds(retention.health_check_secs.min(i64::MAX as u64) as i64);
    health_store::prune_health_checks(db, cutoff).await
}
