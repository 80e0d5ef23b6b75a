use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use common::api::BandwidthState;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::directory::{BandwidthUsage, ServerDirectory};
use crate::notify::{DynNotifier, OperatorAlert};
use crate::Result;

/// Calendar month a set of counters belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingMonth {
    year: i32,
    month: u32,
}

impl BillingMonth {
    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }
}

#[derive(Debug, Default)]
pub struct BandwidthCheck {
    pub counters_reset: Option<u64>,
    pub warning: Vec<BandwidthUsage>,
    pub critical: Vec<BandwidthUsage>,
}

pub async fn bandwidth_loop(state: AppState) {
    let period = Duration::from_secs(state.bandwidth.report_interval_secs.max(60));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut month = BillingMonth::of(Utc::now());

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match run_bandwidth_check(&state.directory, &state.notifier, &mut month, Utc::now()).await {
            Ok(check) => {
                if !check.critical.is_empty() {
                    info!(
                        critical = check.critical.len(),
                        warning = check.warning.len(),
                        "bandwidth check finished"
                    );
                }
            }
            Err(err) => warn!(?err, "bandwidth check failed"),
        }
    }
}

/// Resets counters once the billing month rolls over, then alerts operators
/// about servers past the critical threshold.
pub async fn run_bandwidth_check(
    directory: &ServerDirectory,
    notifier: &DynNotifier,
    month: &mut BillingMonth,
    now: DateTime<Utc>,
) -> Result<BandwidthCheck> {
    let mut check = BandwidthCheck::default();
    let current = BillingMonth::of(now);
    if current != *month {
        check.counters_reset = Some(directory.reset_bandwidth_counters().await?);
        *month = current;
    }

    for usage in directory.bandwidth_report().await? {
        match usage.status {
            BandwidthState::Critical => {
                let alert = OperatorAlert::BandwidthCritical {
                    server_id: usage.server_id,
                    server_name: usage.server_name.clone(),
                    percentage: usage.percentage,
                };
                if let Err(err) = notifier.notify_operator(&alert).await {
                    warn!(server = %usage.server_name, ?err, "bandwidth alert delivery failed");
                }
                check.critical.push(usage);
            }
            BandwidthState::Warning => check.warning.push(usage),
            BandwidthState::Ok => {}
        }
    }
    Ok(check)
}
