//! Registry of VPN servers: capacity, load, health and bandwidth.

use ::metrics::gauge;
use common::api;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{BandwidthConfig, SelectionConfig};
use crate::error::{FleetError, FleetResult};
use crate::persistence::{
    bandwidth as bandwidth_store, devices as device_store, health as health_store,
    servers as server_store, Db, HealthCheckRecord, HealthStatus, NewServer, ServerRecord,
    UptimeWindow,
};

const STATS_BANDWIDTH_DAYS: u32 = 30;
const WARNING_PERCENT: f64 = 75.0;
const CRITICAL_PERCENT: f64 = 90.0;

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub server: ServerRecord,
    pub window: UptimeWindow,
    pub bandwidth_30d: i64,
}

impl ServerStats {
    pub fn to_api(&self) -> api::ServerStatsResponse {
        api::ServerStatsResponse {
            server: self.server.to_api(),
            total_checks: self.window.total,
            successful_checks: self.window.successful,
            uptime_percentage: self.window.percentage(),
            load_percentage: self.server.load_percentage(),
            bandwidth_30d_bytes: self.bandwidth_30d,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthUsage {
    pub server_id: Uuid,
    pub server_name: String,
    pub used_bytes: i64,
    pub cap_bytes: i64,
    pub percentage: f64,
    pub status: api::BandwidthState,
}

impl BandwidthUsage {
    fn classify(percentage: f64) -> api::BandwidthState {
        if percentage > CRITICAL_PERCENT {
            api::BandwidthState::Critical
        } else if percentage > WARNING_PERCENT {
            api::BandwidthState::Warning
        } else {
            api::BandwidthState::Ok
        }
    }

    pub fn to_api(&self) -> api::BandwidthUsageResponse {
        api::BandwidthUsageResponse {
            server_id: self.server_id,
            server_name: self.server_name.clone(),
            used_bytes: self.used_bytes,
            cap_bytes: self.cap_bytes,
            percentage: self.percentage,
            status: self.status,
        }
    }
}

#[derive(Clone)]
pub struct ServerDirectory {
    db: Db,
    uptime_window: u32,
    bandwidth: BandwidthConfig,
}

impl ServerDirectory {
    pub fn new(db: Db, selection: &SelectionConfig, bandwidth: BandwidthConfig) -> Self {
        Self {
            db,
            uptime_window: selection.uptime_window_checks.max(1),
            bandwidth,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub async fn get(&self, id: Uuid) -> FleetResult<ServerRecord> {
        server_store::get_server(&self.db, id)
            .await?
            .ok_or_else(|| FleetError::server_not_found(id))
    }

    pub async fn create(&self, new_server: NewServer) -> FleetResult<ServerRecord> {
        if new_server.name.trim().is_empty() {
            return Err(FleetError::InvalidInput("server name cannot be empty".into()));
        }
        if new_server.address.trim().is_empty() {
            return Err(FleetError::InvalidInput("server address cannot be empty".into()));
        }
        if new_server.max_users < 0 {
            return Err(FleetError::InvalidInput("max_users cannot be negative".into()));
        }
        let record = server_store::create_server(&self.db, new_server).await?;
        info!(server_id = %record.id, name = %record.name, "server registered");
        Ok(record)
    }

    pub async fn list_active(&self, include_hidden: bool) -> FleetResult<Vec<ServerRecord>> {
        Ok(server_store::list_servers(&self.db, false, include_hidden).await?)
    }

    pub async fn list_all(&self) -> FleetResult<Vec<ServerRecord>> {
        Ok(server_store::list_servers(&self.db, true, true).await?)
    }

    pub async fn find_by_location(&self, location: &str) -> FleetResult<Option<ServerRecord>> {
        Ok(server_store::find_by_location(&self.db, location.trim()).await?)
    }

    pub async fn deactivate(&self, id: Uuid) -> FleetResult<ServerRecord> {
        if !server_store::set_active(&self.db, id, false).await? {
            return Err(FleetError::server_not_found(id));
        }
        info!(server_id = %id, "server deactivated");
        self.get(id).await
    }

    /// Takes one slot on the server. Fails when the server is full or inactive.
    pub async fn increment_load(&self, id: Uuid) -> FleetResult<()> {
        if server_store::try_increment_load(&self.db, id).await? {
            return Ok(());
        }
        // Distinguish a missing server from a full one.
        self.get(id).await?;
        Err(FleetError::CapacityExhausted { server_id: id })
    }

    pub async fn decrement_load(&self, id: Uuid) -> FleetResult<()> {
        if server_store::decrement_load(&self.db, id).await? {
            Ok(())
        } else {
            Err(FleetError::server_not_found(id))
        }
    }

    /// Records a health observation; returns the status the server had before.
    pub async fn update_health_status(
        &self,
        id: Uuid,
        status: HealthStatus,
        response_time_ms: Option<i64>,
        detail: Option<&str>,
    ) -> FleetResult<HealthStatus> {
        let previous =
            health_store::record_health(&self.db, id, status, response_time_ms, detail)
                .await?
                .ok_or_else(|| FleetError::server_not_found(id))?;
        gauge!("fleet_server_online", "server_id" => id.to_string())
            .set(if status == HealthStatus::Offline { 0.0 } else { 1.0 });
        if previous != status {
            info!(
                server_id = %id,
                from = previous.as_str(),
                to = status.as_str(),
                "server health changed"
            );
        } else {
            debug!(server_id = %id, status = status.as_str(), "health recorded");
        }
        Ok(previous)
    }

    pub async fn is_available(&self, id: Uuid) -> FleetResult<bool> {
        Ok(server_store::get_server(&self.db, id)
            .await?
            .is_some_and(|server| server.is_available()))
    }

    pub async fn health_history(&self, id: Uuid, limit: u32) -> FleetResult<Vec<HealthCheckRecord>> {
        Ok(health_store::health_history(&self.db, id, limit).await?)
    }

    pub async fn uptime(&self, id: Uuid) -> FleetResult<UptimeWindow> {
        Ok(health_store::uptime_window(&self.db, id, self.uptime_window).await?)
    }

    pub async fn uptime_percentage(&self, id: Uuid) -> FleetResult<f64> {
        Ok(self.uptime(id).await?.percentage())
    }

    pub async fn stats(&self, id: Uuid) -> FleetResult<ServerStats> {
        let server = self.get(id).await?;
        let window = self.uptime(id).await?;
        let bandwidth_30d = bandwidth_store::total_since(&self.db, id, STATS_BANDWIDTH_DAYS).await?;
        Ok(ServerStats {
            server,
            window,
            bandwidth_30d,
        })
    }

    pub async fn active_device_count(&self, id: Uuid) -> FleetResult<i64> {
        Ok(device_store::count_active_devices_on_server(&self.db, id).await?)
    }

    pub async fn record_bandwidth(&self, id: Uuid, bytes_sent: u64, bytes_received: u64) -> FleetResult<BandwidthUsage> {
        let server = self.get(id).await?;
        let sent = i64::try_from(bytes_sent)
            .map_err(|_| FleetError::InvalidInput("bytes_sent out of range".into()))?;
        let received = i64::try_from(bytes_received)
            .map_err(|_| FleetError::InvalidInput("bytes_received out of range".into()))?;
        bandwidth_store::record_usage(&self.db, server.id, sent, received).await?;
        self.bandwidth_usage(id).await
    }

    pub async fn bandwidth_usage(&self, id: Uuid) -> FleetResult<BandwidthUsage> {
        let server = self.get(id).await?;
        Ok(self.usage_for(&server))
    }

    /// Servers at warning or critical level, most loaded first.
    pub async fn bandwidth_report(&self) -> FleetResult<Vec<BandwidthUsage>> {
        let mut report: Vec<BandwidthUsage> = self
            .list_active(true)
            .await?
            .iter()
            .map(|server| self.usage_for(server))
            .filter(|usage| usage.status != api::BandwidthState::Ok)
            .collect();
        report.sort_by(|a, b| b.percentage.total_cmp(&a.percentage));
        Ok(report)
    }

    pub async fn reset_bandwidth_counters(&self) -> FleetResult<u64> {
        let reset = server_store::reset_bandwidth_used(&self.db).await?;
        info!(servers = reset, "monthly bandwidth counters reset");
        Ok(reset)
    }

    fn usage_for(&self, server: &ServerRecord) -> BandwidthUsage {
        let cap_bytes = server
            .bandwidth_cap_bytes
            .filter(|cap| *cap > 0)
            .unwrap_or_else(|| self.bandwidth.cap_bytes_for(server.provider.as_deref()));
        let percentage = if cap_bytes > 0 {
            ((server.bandwidth_used as f64 * 100.0 / cap_bytes as f64) * 10.0).round() / 10.0
        } else {
            0.0
        };
        BandwidthUsage {
            server_id: server.id,
            server_name: server.name.clone(),
            used_bytes: server.bandwidth_used,
            cap_bytes,
            percentage,
            status: BandwidthUsage::classify(percentage),
        }
    }
}
