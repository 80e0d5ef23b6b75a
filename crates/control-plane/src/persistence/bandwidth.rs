use chrono::{Duration, NaiveDate, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct BandwidthDay {
    pub server_id: Uuid,
    pub day: NaiveDate,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub total_bytes: i64,
}

/// Adds a traffic delta to today's row and to the server's running monthly counter.
pub async fn record_usage(pool: &Db, server_id: Uuid, bytes_sent: i64, bytes_received: i64) -> Result<()> {
    let total = bytes_sent.saturating_add(bytes_received);
    let today = Utc::now().date_naive();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO server_bandwidth (server_id, day, bytes_sent, bytes_received, total_bytes)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (server_id, day) DO UPDATE SET
            bytes_sent = bytes_sent + excluded.bytes_sent,
            bytes_received = bytes_received + excluded.bytes_received,
            total_bytes = total_bytes + excluded.total_bytes
        "#,
    )
    .bind(server_id)
    .bind(today)
    .bind(bytes_sent)
    .bind(bytes_received)
    .bind(total)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE servers SET bandwidth_used = bandwidth_used + ?2, updated_at = ?3 WHERE id = ?1",
    )
    .bind(server_id)
    .bind(total)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Daily rows of the last `days` days, newest first.
pub async fn usage_history(pool: &Db, server_id: Uuid, days: u32) -> Result<Vec<BandwidthDay>> {
    let since = Utc::now().date_naive() - Duration::days(i64::from(days));
    let records = sqlx::query_as::<_, BandwidthDay>(
        r#"
        SELECT server_id, day, bytes_sent, bytes_received, total_bytes
        FROM server_bandwidth
        WHERE server_id = ?1 AND day >= ?2
        ORDER BY day DESC
        "#,
    )
    .bind(server_id)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn total_since(pool: &Db, server_id: Uuid, days: u32) -> Result<i64> {
    let since = Utc::now().date_naive() - Duration::days(i64::from(days));
    let total: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(total_bytes), 0) FROM server_bandwidth WHERE server_id = ?1 AND day >= ?2",
    )
    .bind(server_id)
    .bind(since)
    .fetch_one(pool)
    .await?;
    Ok(total)
}
