use chrono::{DateTime, Utc};
use common::api;
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum FailoverStatus {
    Completed,
    NoBackup,
    Cancelled,
}

impl From<FailoverStatus> for api::FailoverOutcome {
    fn from(value: FailoverStatus) -> Self {
        match value {
            FailoverStatus::Completed => api::FailoverOutcome::Completed,
            FailoverStatus::NoBackup => api::FailoverOutcome::NoBackup,
            FailoverStatus::Cancelled => api::FailoverOutcome::Cancelled,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FailoverLogRecord {
    pub id: i64,
    pub from_server_id: Uuid,
    pub to_server_id: Option<Uuid>,
    pub status: FailoverStatus,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

impl FailoverLogRecord {
    pub fn to_api(&self) -> api::FailoverLogResponse {
        api::FailoverLogResponse {
            id: self.id,
            from_server_id: self.from_server_id,
            to_server_id: self.to_server_id,
            status: self.status.into(),
            details: self.details.clone(),
            created_at: self.created_at,
        }
    }
}

pub async fn append(
    pool: &Db,
    from_server_id: Uuid,
    to_server_id: Option<Uuid>,
    status: FailoverStatus,
    details: &str,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO failover_log (from_server_id, to_server_id, status, details, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(from_server_id)
    .bind(to_server_id)
    .bind(status)
    .bind(details)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Newest first, optionally restricted to one failed server.
pub async fn list_entries(
    pool: &Db,
    from_server_id: Option<Uuid>,
    limit: u32,
) -> Result<Vec<FailoverLogRecord>> {
    let records = sqlx::query_as::<_, FailoverLogRecord>(
        r#"
        SELECT id, from_server_id, to_server_id, status, details, created_at
        FROM failover_log
        WHERE (?1 IS NULL OR from_server_id = ?1)
        ORDER BY id DESC
        LIMIT ?2
        "#,
    )
    .bind(from_server_id)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    Ok(records)
}
