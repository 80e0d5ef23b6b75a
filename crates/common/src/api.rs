//! Operator API DTOs served by the control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::peer::PeerEntry;

/// Health of a VPN node as last observed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Node answers health probes normally.
    Online,
    /// Node answers but reports reduced service.
    Degraded,
    /// Node did not answer.
    Offline,
}

impl HealthState {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Online => "online",
            HealthState::Degraded => "degraded",
            HealthState::Offline => "offline",
        }
    }
}

/// Who may be placed on a server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Open to every subscriber.
    Public,
    /// Reserved for VIP subscribers.
    Vip,
}

impl AccessLevel {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Public => "public",
            AccessLevel::Vip => "vip",
        }
    }
}

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Device holds a live peer and is migrated on failover.
    Active,
    /// Device is parked and ignored by failover.
    Inactive,
}

/// Bandwidth consumption relative to the provider cap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BandwidthState {
    /// Below 75% of the cap.
    Ok,
    /// Between 75% and 90% of the cap.
    Warning,
    /// Above 90% of the cap.
    Critical,
}

/// Outcome recorded for a failover run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailoverOutcome {
    /// Every device was attempted.
    Completed,
    /// No backup server was eligible.
    NoBackup,
    /// The run stopped early on cancellation or deadline.
    Cancelled,
}

/// Admin request registering a VPN node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCreateRequest {
    /// Unique display name.
    pub name: String,
    /// Human readable location, e.g. `New York`.
    pub location: String,
    /// ISO country code.
    #[serde(default)]
    pub country_code: Option<String>,
    /// Host or IP of the node.
    pub address: String,
    /// Port of the node management API.
    #[serde(default)]
    pub api_port: Option<u16>,
    /// WireGuard listen port.
    #[serde(default)]
    pub wg_port: Option<u16>,
    /// WireGuard server public key, used in client configs.
    #[serde(default)]
    pub wg_public_key: Option<String>,
    /// DNS servers pushed to clients.
    #[serde(default)]
    pub dns: Option<String>,
    /// Hosting provider name.
    #[serde(default)]
    pub provider: Option<String>,
    /// Capacity in concurrent devices.
    pub max_users: u32,
    /// Access level, public by default.
    #[serde(default)]
    pub access_level: Option<AccessLevel>,
    /// Whether the server is offered to regular selection.
    #[serde(default)]
    pub is_visible: Option<bool>,
    /// VIP subscriber bound to this server.
    #[serde(default)]
    pub vip_email: Option<String>,
    /// User owning this server exclusively.
    #[serde(default)]
    pub dedicated_user_email: Option<String>,
    /// Whether port forwarding is offered.
    #[serde(default)]
    pub port_forwarding_allowed: Option<bool>,
    /// Monthly bandwidth cap overriding the provider default.
    #[serde(default)]
    pub bandwidth_cap_bytes: Option<i64>,
    /// Management API secret stored in the credential store.
    #[serde(default)]
    pub api_secret: Option<String>,
}

/// Server as exposed to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerResponse {
    /// Server identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Location label.
    pub location: String,
    /// ISO country code.
    pub country_code: Option<String>,
    /// Host or IP.
    pub address: String,
    /// Management API port.
    pub api_port: u16,
    /// WireGuard port.
    pub wg_port: u16,
    /// Hosting provider.
    pub provider: Option<String>,
    /// Capacity.
    pub max_users: i64,
    /// Devices currently bound.
    pub current_users: i64,
    /// `current_users / max_users` in percent, one decimal.
    pub load_percentage: f64,
    /// Access level.
    pub access_level: AccessLevel,
    /// Offered to regular selection.
    pub is_visible: bool,
    /// Soft-deactivation flag.
    pub is_active: bool,
    /// Bound to a single user.
    pub dedicated: bool,
    /// Port forwarding offered.
    pub port_forwarding_allowed: bool,
    /// Last observed health.
    pub health_status: HealthState,
    /// Time of the last health check.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Bytes used in the current billing month.
    pub bandwidth_used: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Aggregated health and load figures for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatsResponse {
    /// The server.
    pub server: ServerResponse,
    /// Health checks inside the uptime window.
    pub total_checks: i64,
    /// Online checks inside the uptime window.
    pub successful_checks: i64,
    /// Rolling success rate in percent.
    pub uptime_percentage: f64,
    /// Load in percent.
    pub load_percentage: f64,
    /// Bytes transferred over the last 30 days.
    pub bandwidth_30d_bytes: i64,
}

/// Health result pushed by an external poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReportRequest {
    /// Observed state.
    pub status: HealthState,
    /// Probe latency.
    #[serde(default)]
    pub response_time_ms: Option<i64>,
    /// Free-form detail.
    #[serde(default)]
    pub detail: Option<String>,
}

/// One entry of a server's health history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// Observed state.
    pub status: HealthState,
    /// Probe latency.
    pub response_time_ms: Option<i64>,
    /// Free-form detail.
    pub detail: Option<String>,
    /// Observation time.
    pub checked_at: DateTime<Utc>,
}

/// Replaces the management API secret of a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRequest {
    /// New secret.
    pub api_secret: String,
}

/// Bandwidth delta reported for a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthReportRequest {
    /// Bytes sent since the last report.
    pub bytes_sent: u64,
    /// Bytes received since the last report.
    pub bytes_received: u64,
}

/// Bandwidth position of a server against its cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthUsageResponse {
    /// Server identifier.
    pub server_id: Uuid,
    /// Display name.
    pub server_name: String,
    /// Bytes used this month.
    pub used_bytes: i64,
    /// Monthly cap.
    pub cap_bytes: i64,
    /// Usage in percent, one decimal.
    pub percentage: f64,
    /// Classification.
    pub status: BandwidthState,
}

/// Identifies the subscriber a selection or provisioning is done for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionRequest {
    /// External user identifier.
    pub user_id: i64,
    /// User email, used for dedicated-server bindings.
    pub email: String,
    /// VIP entitlement.
    #[serde(default)]
    pub vip: bool,
}

/// Provision a device for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCreateRequest {
    /// External user identifier.
    pub user_id: i64,
    /// User email.
    pub email: String,
    /// VIP entitlement.
    #[serde(default)]
    pub vip: bool,
    /// Device label.
    pub name: String,
    /// Base64 WireGuard public key generated on the client.
    pub public_key: String,
    /// Requested overlay address; allocated when omitted.
    #[serde(default)]
    pub assigned_ip: Option<String>,
}

/// Device as exposed to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceResponse {
    /// Device identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: i64,
    /// Device label.
    pub name: String,
    /// WireGuard public key.
    pub public_key: String,
    /// Overlay address without prefix.
    pub assigned_ip: String,
    /// Server currently hosting the peer.
    pub server_id: Uuid,
    /// Lifecycle state.
    pub status: DeviceState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Move a device to another server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateDeviceRequest {
    /// Destination server.
    pub server_id: Uuid,
}

/// Result of a failover run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailoverSummaryResponse {
    /// Name of the failed server.
    pub failed_server: String,
    /// Name of the backup that received the devices.
    pub backup_server: String,
    /// Devices moved successfully.
    pub migrated: u32,
    /// Devices whose migration failed.
    pub failed: u32,
    /// Devices not attempted because the run stopped early.
    pub skipped: u32,
    /// Run outcome.
    pub outcome: FailoverOutcome,
}

/// One failover log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverLogResponse {
    /// Entry identifier.
    pub id: i64,
    /// Failed server.
    pub from_server_id: Uuid,
    /// Backup server, absent when none was found.
    pub to_server_id: Option<Uuid>,
    /// Outcome.
    pub status: FailoverOutcome,
    /// Human readable counts.
    pub details: String,
    /// Time of the run.
    pub created_at: DateTime<Utc>,
}

/// Peers registered on a node according to the node itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPeersResponse {
    /// Server identifier.
    pub server_id: Uuid,
    /// Peers reported by the node.
    pub peers: Vec<PeerEntry>,
}

/// Differences between device rows and peers registered on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileResponse {
    /// Server identifier.
    pub server_id: Uuid,
    /// Public keys bound to the server in the database but absent remotely.
    pub missing_on_remote: Vec<String>,
    /// Public keys present remotely with no matching device row.
    pub unknown_on_remote: Vec<String>,
}

/// Rendered WireGuard client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfigResponse {
    /// Device identifier.
    pub device_id: Uuid,
    /// Config text; the private key placeholder is filled in on the client.
    pub config: String,
}

/// Paging parameter shared by history endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitQuery {
    /// Maximum rows returned.
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Filters for the server listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerListQuery {
    /// Include servers hidden from public selection.
    #[serde(default)]
    pub include_hidden: bool,
    /// Include deactivated servers.
    #[serde(default)]
    pub include_inactive: bool,
    /// Only the server matching this location or country code.
    #[serde(default)]
    pub location: Option<String>,
}

/// Server chosen for a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResponse {
    /// The chosen server.
    pub server: ServerResponse,
    /// `dedicated` or `least_loaded`.
    pub reason: String,
}

/// Counters reset by a monthly bandwidth rollover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthResetResponse {
    /// Servers whose running counter was cleared.
    pub servers_reset: u64,
}

/// Filters for the failover history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailoverLogQuery {
    /// Only runs for this failed server.
    #[serde(default)]
    pub server_id: Option<Uuid>,
    /// Maximum rows returned.
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Filter for the device listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceListQuery {
    /// Owner whose devices are listed.
    pub user_id: i64,
}
