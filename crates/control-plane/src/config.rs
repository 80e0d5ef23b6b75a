use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Deserializer};

pub const ENV_PREFIX: &str = "FLEET_CP";

const MAX_HEALTH_TIMEOUT_SECS: u64 = 10;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub operator: OperatorAuthConfig,
    pub peer_api: PeerApiConfig,
    pub health: HealthMonitorConfig,
    pub failover: FailoverConfig,
    pub selection: SelectionConfig,
    pub ipam: IpamConfig,
    pub retention: RetentionConfig,
    pub notifications: NotificationConfig,
    pub bandwidth: BandwidthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorAuthConfig {
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub tokens: Vec<String>,
    pub header_name: String,
}

fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(value) => Ok(value.split(',').map(|s| s.to_string()).collect()),
        StringOrVec::Vec(values) => Ok(values),
    }
}

/// Client settings for the node management API.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerApiConfig {
    /// `https` in production; `http` only for local nodes and tests.
    pub scheme: String,
    /// Skip certificate validation, for nodes with self-signed certificates.
    pub accept_invalid_certs: bool,
    pub connect_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthMonitorConfig {
    pub enabled: bool,
    pub sweep_interval_secs: u64,
    pub max_concurrency: usize,
    pub failover_on_offline: bool,
    pub offline_checks_before_failover: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    pub max_parallel_migrations: usize,
    pub run_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    pub uptime_window_checks: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpamConfig {
    /// Fleet-wide overlay subnet; device addresses are unique across all servers.
    pub subnet: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    pub health_check_secs: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BandwidthConfig {
    pub default_cap_gb: u64,
    pub flyio_cap_gb: u64,
    pub report_interval_secs: u64,
}

impl PeerApiConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !matches!(self.scheme.as_str(), "http" | "https") {
            anyhow::bail!("peer_api.scheme must be http or https");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("peer_api.connect_timeout_secs must be > 0");
        }
        if self.health_timeout_secs == 0 || self.health_timeout_secs > MAX_HEALTH_TIMEOUT_SECS {
            anyhow::bail!("peer_api.health_timeout_secs must be between 1 and {MAX_HEALTH_TIMEOUT_SECS}");
        }
        if self.request_timeout_secs == 0 || self.request_timeout_secs > MAX_REQUEST_TIMEOUT_SECS {
            anyhow::bail!(
                "peer_api.request_timeout_secs must be between 1 and {MAX_REQUEST_TIMEOUT_SECS}"
            );
        }
        Ok(())
    }
}

impl Default for PeerApiConfig {
    fn default() -> Self {
        Self {
            scheme: "https".into(),
            accept_invalid_certs: false,
            connect_timeout_secs: 5,
            health_timeout_secs: 5,
            request_timeout_secs: 15,
        }
    }
}

impl HealthMonitorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("health.sweep_interval_secs must be > 0");
        }
        if self.max_concurrency == 0 {
            anyhow::bail!("health.max_concurrency must be > 0");
        }
        Ok(())
    }
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 300,
            max_concurrency: 8,
            failover_on_offline: true,
            offline_checks_before_failover: 2,
        }
    }
}

impl FailoverConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_parallel_migrations == 0 {
            anyhow::bail!("failover.max_parallel_migrations must be > 0");
        }
        if self.run_timeout_secs == 0 {
            anyhow::bail!("failover.run_timeout_secs must be > 0");
        }
        Ok(())
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_parallel_migrations: 4,
            run_timeout_secs: 300,
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            uptime_window_checks: 100,
        }
    }
}

impl IpamConfig {
    pub fn network(&self) -> anyhow::Result<Ipv4Network> {
        let network: Ipv4Network = self
            .subnet
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid ipam.subnet {}: {}", self.subnet, err))?;
        if network.prefix() > 30 {
            anyhow::bail!("ipam.subnet must leave room for hosts (prefix <= 30)");
        }
        Ok(network)
    }
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            subnet: "10.8.0.0/16".into(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            health_check_secs: 30 * 24 * 60 * 60,
            cleanup_interval_secs: 60 * 60,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 5,
        }
    }
}

impl BandwidthConfig {
    /// Monthly cap for a provider when the server does not carry its own.
    pub fn cap_bytes_for(&self, provider: Option<&str>) -> i64 {
        let gb = match provider.map(|p| p.trim().to_ascii_lowercase()) {
            Some(p) if p == "fly.io" || p == "flyio" || p == "fly" => self.flyio_cap_gb,
            _ => self.default_cap_gb,
        };
        i64::try_from(gb.saturating_mul(1024 * 1024 * 1024)).unwrap_or(i64::MAX)
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            default_cap_gb: 1000,
            flyio_cap_gb: 100,
            report_interval_secs: 60 * 60,
        }
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric secrets are not coerced.
        .try_parsing(false);

    let peer_api = PeerApiConfig::default();
    let health = HealthMonitorConfig::default();
    let failover = FailoverConfig::default();
    let retention = RetentionConfig::default();
    let bandwidth = BandwidthConfig::default();

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("database.url", "sqlite://data/fleet-control-plane.db")?
        .set_default("operator.tokens", vec!["dev-operator-token"])?
        .set_default("operator.header_name", "authorization")?
        .set_default("peer_api.scheme", peer_api.scheme)?
        .set_default("peer_api.accept_invalid_certs", peer_api.accept_invalid_certs)?
        .set_default("peer_api.connect_timeout_secs", peer_api.connect_timeout_secs)?
        .set_default("peer_api.health_timeout_secs", peer_api.health_timeout_secs)?
        .set_default("peer_api.request_timeout_secs", peer_api.request_timeout_secs)?
        .set_default("health.enabled", health.enabled)?
        .set_default("health.sweep_interval_secs", health.sweep_interval_secs)?
        .set_default("health.max_concurrency", health.max_concurrency as u64)?
        .set_default("health.failover_on_offline", health.failover_on_offline)?
        .set_default(
            "health.offline_checks_before_failover",
            health.offline_checks_before_failover,
        )?
        .set_default(
            "failover.max_parallel_migrations",
            failover.max_parallel_migrations as u64,
        )?
        .set_default("failover.run_timeout_secs", failover.run_timeout_secs)?
        .set_default(
            "selection.uptime_window_checks",
            SelectionConfig::default().uptime_window_checks,
        )?
        .set_default("ipam.subnet", IpamConfig::default().subnet)?
        .set_default("retention.health_check_secs", retention.health_check_secs)?
        .set_default("retention.cleanup_interval_secs", retention.cleanup_interval_secs)?
        .set_default("notifications.webhook_url", Option::<String>::None)?
        .set_default("notifications.timeout_secs", NotificationConfig::default().timeout_secs)?
        .set_default("bandwidth.default_cap_gb", bandwidth.default_cap_gb)?
        .set_default("bandwidth.flyio_cap_gb", bandwidth.flyio_cap_gb)?
        .set_default("bandwidth.report_interval_secs", bandwidth.report_interval_secs)?;

    let cfg = builder.build()?;
    let mut app: AppConfig = cfg.try_deserialize()?;
    app.peer_api.scheme = app.peer_api.scheme.trim().to_ascii_lowercase();
    if let Some(url) = app.notifications.webhook_url.take() {
        let trimmed = url.trim();
        if !trimmed.is_empty() {
            app.notifications.webhook_url = Some(trimmed.to_string());
        }
    }
    app.peer_api.validate()?;
    app.health.validate()?;
    app.failover.validate()?;
    app.ipam.network()?;
    if app.selection.uptime_window_checks == 0 {
        anyhow::bail!("selection.uptime_window_checks must be > 0");
    }
    Ok(app)
}
