use chrono::{DateTime, Utc};
use common::api;
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Inactive,
}

impl From<DeviceStatus> for api::DeviceState {
    fn from(value: DeviceStatus) -> Self {
        match value {
            DeviceStatus::Active => api::DeviceState::Active,
            DeviceStatus::Inactive => api::DeviceState::Inactive,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DeviceRecord {
    pub id: Uuid,
    pub user_id: i64,
    pub name: String,
    pub public_key: String,
    pub assigned_ip: String,
    pub server_id: Uuid,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// Allowed-IPs value registered on the node for this device.
    pub fn allowed_ips(&self) -> String {
        format!("{}/32", self.assigned_ip)
    }

    pub fn to_api(&self) -> api::DeviceResponse {
        api::DeviceResponse {
            id: self.id,
            user_id: self.user_id,
            name: self.name.clone(),
            public_key: self.public_key.clone(),
            assigned_ip: self.assigned_ip.clone(),
            server_id: self.server_id,
            status: self.status.into(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDevice {
    pub id: Uuid,
    pub user_id: i64,
    pub name: String,
    pub public_key: String,
    pub assigned_ip: String,
    pub server_id: Uuid,
}

pub async fn create_device(pool: &Db, new_device: NewDevice) -> Result<DeviceRecord> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO devices (id, user_id, name, public_key, assigned_ip, server_id, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
        "#,
    )
    .bind(new_device.id)
    .bind(new_device.user_id)
    .bind(&new_device.name)
    .bind(&new_device.public_key)
    .bind(&new_device.assigned_ip)
    .bind(new_device.server_id)
    .bind(DeviceStatus::Active)
    .bind(now)
    .execute(pool)
    .await?;

    get_device(pool, new_device.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("device {} vanished after insert", new_device.id))
}

pub async fn get_device(pool: &Db, id: Uuid) -> Result<Option<DeviceRecord>> {
    let record = sqlx::query_as::<_, DeviceRecord>(
        r#"
        SELECT id, user_id, name, public_key, assigned_ip, server_id, status, created_at, updated_at
        FROM devices
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn find_device_by_public_key(pool: &Db, public_key: &str) -> Result<Option<DeviceRecord>> {
    let record = sqlx::query_as::<_, DeviceRecord>(
        r#"
        SELECT id, user_id, name, public_key, assigned_ip, server_id, status, created_at, updated_at
        FROM devices
        WHERE public_key = ?1
        "#,
    )
    .bind(public_key)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_devices_for_server(
    pool: &Db,
    server_id: Uuid,
    status: Option<DeviceStatus>,
) -> Result<Vec<DeviceRecord>> {
    let records = sqlx::query_as::<_, DeviceRecord>(
        r#"
        SELECT id, user_id, name, public_key, assigned_ip, server_id, status, created_at, updated_at
        FROM devices
        WHERE server_id = ?1 AND (?2 IS NULL OR status = ?2)
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(server_id)
    .bind(status)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn list_devices_for_user(pool: &Db, user_id: i64) -> Result<Vec<DeviceRecord>> {
    let records = sqlx::query_as::<_, DeviceRecord>(
        r#"
        SELECT id, user_id, name, public_key, assigned_ip, server_id, status, created_at, updated_at
        FROM devices
        WHERE user_id = ?1
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn count_active_devices_on_server(pool: &Db, server_id: Uuid) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM devices WHERE server_id = ?1 AND status = 'active'")
            .bind(server_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Every overlay address currently handed out, across the whole fleet.
pub async fn list_assigned_ips(pool: &Db) -> Result<Vec<String>> {
    let ips = sqlx::query_scalar("SELECT assigned_ip FROM devices")
        .fetch_all(pool)
        .await?;
    Ok(ips)
}

/// Moves the device from `from` to `to`. Returns `false` when the row is gone
/// or no longer on `from`.
pub async fn update_device_server(pool: &Db, id: Uuid, from: Uuid, to: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE devices SET server_id = ?3, updated_at = ?4 WHERE id = ?1 AND server_id = ?2",
    )
    .bind(id)
    .bind(from)
    .bind(to)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn update_device_status(pool: &Db, id: Uuid, status: DeviceStatus) -> Result<bool> {
    let result = sqlx::query("UPDATE devices SET status = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(status)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Deletes the device and returns the server it was on at that moment.
pub async fn delete_device(pool: &Db, id: Uuid) -> Result<Option<Uuid>> {
    let server_id =
        sqlx::query_scalar::<_, Uuid>("DELETE FROM devices WHERE id = ?1 RETURNING server_id")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(server_id)
}
