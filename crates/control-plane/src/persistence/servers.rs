use chrono::{DateTime, Utc};
use common::api;
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

pub const DEFAULT_API_PORT: u16 = 8443;
pub const DEFAULT_WG_PORT: u16 = 51820;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum HealthStatus {
    Online,
    Degraded,
    Offline,
}

impl From<HealthStatus> for api::HealthState {
    fn from(value: HealthStatus) -> Self {
        match value {
            HealthStatus::Online => api::HealthState::Online,
            HealthStatus::Degraded => api::HealthState::Degraded,
            HealthStatus::Offline => api::HealthState::Offline,
        }
    }
}

impl From<api::HealthState> for HealthStatus {
    fn from(value: api::HealthState) -> Self {
        match value {
            api::HealthState::Online => HealthStatus::Online,
            api::HealthState::Degraded => HealthStatus::Degraded,
            api::HealthState::Offline => HealthStatus::Offline,
        }
    }
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        api::HealthState::from(*self).as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum AccessLevel {
    Public,
    Vip,
}

impl From<AccessLevel> for api::AccessLevel {
    fn from(value: AccessLevel) -> Self {
        match value {
            AccessLevel::Public => api::AccessLevel::Public,
            AccessLevel::Vip => api::AccessLevel::Vip,
        }
    }
}

impl From<api::AccessLevel> for AccessLevel {
    fn from(value: api::AccessLevel) -> Self {
        match value {
            api::AccessLevel::Public => AccessLevel::Public,
            api::AccessLevel::Vip => AccessLevel::Vip,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ServerRecord {
    pub id: Uuid,
    pub name: String,
    pub location: String,
    pub country_code: Option<String>,
    pub address: String,
    pub api_port: i64,
    pub wg_port: i64,
    pub wg_public_key: Option<String>,
    pub dns: Option<String>,
    pub provider: Option<String>,
    pub max_users: i64,
    pub current_users: i64,
    pub bandwidth_used: i64,
    pub bandwidth_cap_bytes: Option<i64>,
    pub access_level: AccessLevel,
    pub is_visible: bool,
    pub is_active: bool,
    pub vip_email: Option<String>,
    pub dedicated_user_email: Option<String>,
    pub port_forwarding_allowed: bool,
    pub health_status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRecord {
    /// Bound to a single user, either through a VIP email or a dedicated owner.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated_user_email.is_some() || self.vip_email.is_some()
    }

    pub fn has_capacity(&self) -> bool {
        self.current_users < self.max_users
    }

    pub fn is_available(&self) -> bool {
        self.is_active && self.health_status == HealthStatus::Online && self.has_capacity()
    }

    pub fn load_percentage(&self) -> f64 {
        if self.max_users <= 0 {
            return 100.0;
        }
        let pct = self.current_users as f64 * 100.0 / self.max_users as f64;
        (pct * 10.0).round() / 10.0
    }

    /// Orders two servers by `current_users / max_users` without floating point.
    pub fn cmp_load(&self, other: &ServerRecord) -> std::cmp::Ordering {
        let lhs = (self.current_users as i128) * (other.max_users.max(1) as i128);
        let rhs = (other.current_users as i128) * (self.max_users.max(1) as i128);
        lhs.cmp(&rhs)
    }

    pub fn is_bound_to(&self, email: &str) -> bool {
        let matches = |bound: &Option<String>| {
            bound
                .as_deref()
                .is_some_and(|value| value.eq_ignore_ascii_case(email))
        };
        matches(&self.vip_email) || matches(&self.dedicated_user_email)
    }

    pub fn to_api(&self) -> api::ServerResponse {
        api::ServerResponse {
            id: self.id,
            name: self.name.clone(),
            location: self.location.clone(),
            country_code: self.country_code.clone(),
            address: self.address.clone(),
            api_port: u16::try_from(self.api_port).unwrap_or(DEFAULT_API_PORT),
            wg_port: u16::try_from(self.wg_port).unwrap_or(DEFAULT_WG_PORT),
            provider: self.provider.clone(),
            max_users: self.max_users,
            current_users: self.current_users,
            load_percentage: self.load_percentage(),
            access_level: self.access_level.into(),
            is_visible: self.is_visible,
            is_active: self.is_active,
            dedicated: self.is_dedicated(),
            port_forwarding_allowed: self.port_forwarding_allowed,
            health_status: self.health_status.into(),
            last_health_check: self.last_health_check,
            bandwidth_used: self.bandwidth_used,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewServer {
    pub id: Uuid,
    pub name: String,
    pub location: String,
    pub country_code: Option<String>,
    pub address: String,
    pub api_port: u16,
    pub wg_port: u16,
    pub wg_public_key: Option<String>,
    pub dns: Option<String>,
    pub provider: Option<String>,
    pub max_users: i64,
    pub bandwidth_cap_bytes: Option<i64>,
    pub access_level: AccessLevel,
    pub is_visible: bool,
    pub vip_email: Option<String>,
    pub dedicated_user_email: Option<String>,
    pub port_forwarding_allowed: bool,
}

impl NewServer {
    pub fn new(name: impl Into<String>, address: impl Into<String>, max_users: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            location: String::new(),
            country_code: None,
            address: address.into(),
            api_port: DEFAULT_API_PORT,
            wg_port: DEFAULT_WG_PORT,
            wg_public_key: None,
            dns: None,
            provider: None,
            max_users,
            bandwidth_cap_bytes: None,
            access_level: AccessLevel::Public,
            is_visible: true,
            vip_email: None,
            dedicated_user_email: None,
            port_forwarding_allowed: false,
        }
    }
}

const SERVER_COLUMNS: &str = r#"
    id, name, location, country_code, address, api_port, wg_port, wg_public_key, dns,
    provider, max_users, current_users, bandwidth_used, bandwidth_cap_bytes, access_level,
    is_visible, is_active, vip_email, dedicated_user_email, port_forwarding_allowed,
    health_status, last_health_check, created_at, updated_at
"#;

pub async fn create_server(pool: &Db, new_server: NewServer) -> Result<ServerRecord> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO servers (
            id, name, location, country_code, address, api_port, wg_port, wg_public_key,
            dns, provider, max_users, bandwidth_cap_bytes, access_level, is_visible,
            vip_email, dedicated_user_email, port_forwarding_allowed, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)
        "#,
    )
    .bind(new_server.id)
    .bind(&new_server.name)
    .bind(&new_server.location)
    .bind(&new_server.country_code)
    .bind(&new_server.address)
    .bind(i64::from(new_server.api_port))
    .bind(i64::from(new_server.wg_port))
    .bind(&new_server.wg_public_key)
    .bind(&new_server.dns)
    .bind(&new_server.provider)
    .bind(new_server.max_users)
    .bind(new_server.bandwidth_cap_bytes)
    .bind(new_server.access_level)
    .bind(new_server.is_visible)
    .bind(&new_server.vip_email)
    .bind(&new_server.dedicated_user_email)
    .bind(new_server.port_forwarding_allowed)
    .bind(now)
    .execute(pool)
    .await?;

    get_server(pool, new_server.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("server {} vanished after insert", new_server.id))
}

pub async fn get_server(pool: &Db, id: Uuid) -> Result<Option<ServerRecord>> {
    let query = format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?1");
    let record = sqlx::query_as::<_, ServerRecord>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

pub async fn list_servers(pool: &Db, include_inactive: bool, include_hidden: bool) -> Result<Vec<ServerRecord>> {
    let query = format!(
        r#"
        SELECT {SERVER_COLUMNS} FROM servers
        WHERE (?1 OR is_active = 1) AND (?2 OR is_visible = 1)
        ORDER BY location ASC, name ASC
        "#
    );
    let records = sqlx::query_as::<_, ServerRecord>(&query)
        .bind(include_inactive)
        .bind(include_hidden)
        .fetch_all(pool)
        .await?;
    Ok(records)
}

/// Active server bound to the given email through a VIP or dedicated binding.
pub async fn find_bound_server(pool: &Db, email: &str) -> Result<Option<ServerRecord>> {
    let query = format!(
        r#"
        SELECT {SERVER_COLUMNS} FROM servers
        WHERE is_active = 1
          AND (lower(vip_email) = lower(?1) OR lower(dedicated_user_email) = lower(?1))
        ORDER BY name ASC
        LIMIT 1
        "#
    );
    let record = sqlx::query_as::<_, ServerRecord>(&query)
        .bind(email)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Shared public servers that are active, visible, not offline and still have room.
pub async fn list_selection_candidates(pool: &Db) -> Result<Vec<ServerRecord>> {
    let query = format!(
        r#"
        SELECT {SERVER_COLUMNS} FROM servers
        WHERE access_level = 'public'
          AND is_active = 1
          AND is_visible = 1
          AND dedicated_user_email IS NULL
          AND vip_email IS NULL
          AND current_users < max_users
          AND health_status != 'offline'
        "#
    );
    let records = sqlx::query_as::<_, ServerRecord>(&query)
        .fetch_all(pool)
        .await?;
    Ok(records)
}

/// Servers eligible to absorb devices from `exclude`: shared, active, reachable, not full.
pub async fn list_backup_candidates(pool: &Db, exclude: Uuid) -> Result<Vec<ServerRecord>> {
    let query = format!(
        r#"
        SELECT {SERVER_COLUMNS} FROM servers
        WHERE id != ?1
          AND is_active = 1
          AND health_status != 'offline'
          AND dedicated_user_email IS NULL
          AND vip_email IS NULL
          AND current_users < max_users
        "#
    );
    let records = sqlx::query_as::<_, ServerRecord>(&query)
        .bind(exclude)
        .fetch_all(pool)
        .await?;
    Ok(records)
}

/// Active visible server whose location contains `needle` or whose country code equals it.
pub async fn find_by_location(pool: &Db, needle: &str) -> Result<Option<ServerRecord>> {
    let query = format!(
        r#"
        SELECT {SERVER_COLUMNS} FROM servers
        WHERE is_active = 1
          AND is_visible = 1
          AND (instr(lower(location), lower(?1)) > 0 OR lower(country_code) = lower(?1))
        ORDER BY (current_users * 1.0 / max(max_users, 1)) ASC, name ASC
        LIMIT 1
        "#
    );
    let record = sqlx::query_as::<_, ServerRecord>(&query)
        .bind(needle)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Reserves one slot. Returns false when the server is missing, inactive, or full.
pub async fn try_increment_load(pool: &Db, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE servers
        SET current_users = current_users + 1, updated_at = ?2
        WHERE id = ?1 AND is_active = 1 AND current_users < max_users
        "#,
    )
    .bind(id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Releases one slot, never going below zero. Returns false when the server is missing.
pub async fn decrement_load(pool: &Db, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE servers
        SET current_users = CASE WHEN current_users > 0 THEN current_users - 1 ELSE 0 END,
            updated_at = ?2
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_active(pool: &Db, id: Uuid, active: bool) -> Result<bool> {
    let result = sqlx::query("UPDATE servers SET is_active = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(active)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn reset_bandwidth_used(pool: &Db) -> Result<u64> {
    let result = sqlx::query("UPDATE servers SET bandwidth_used = 0, updated_at = ?1")
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
