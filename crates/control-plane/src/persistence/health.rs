use chrono::{DateTime, Utc};
use common::api;
use sqlx::FromRow;
use uuid::Uuid;

use super::{servers::HealthStatus, Db};
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct HealthCheckRecord {
    pub id: i64,
    pub server_id: Uuid,
    pub status: HealthStatus,
    pub response_time_ms: Option<i64>,
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckRecord {
    pub fn to_api(&self) -> api::HealthCheckResponse {
        api::HealthCheckResponse {
            status: self.status.into(),
            response_time_ms: self.response_time_ms,
            detail: self.detail.clone(),
            checked_at: self.checked_at,
        }
    }
}

/// Counts over the most recent health checks of one server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow)]
pub struct UptimeWindow {
    pub total: i64,
    pub successful: i64,
}

impl UptimeWindow {
    /// Share of `online` checks in percent, one decimal. Zero without history.
    pub fn percentage(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        let pct = self.successful as f64 * 100.0 / self.total as f64;
        (pct * 10.0).round() / 10.0
    }
}

/// Stores the new status on the server and appends a check record atomically.
///
/// Returns the status the server had before, or `None` when the server does not exist.
pub async fn record_health(
    pool: &Db,
    server_id: Uuid,
    status: HealthStatus,
    response_time_ms: Option<i64>,
    detail: Option<&str>,
) -> Result<Option<HealthStatus>> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let previous: Option<HealthStatus> =
        sqlx::query_scalar("SELECT health_status FROM servers WHERE id = ?1")
            .bind(server_id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some(previous) = previous else {
        tx.rollback().await?;
        return Ok(None);
    };

    sqlx::query(
        "UPDATE servers SET health_status = ?2, last_health_check = ?3, updated_at = ?3 WHERE id = ?1",
    )
    .bind(server_id)
    .bind(status)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO health_checks (server_id, status, response_time_ms, detail, checked_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(server_id)
    .bind(status)
    .bind(response_time_ms)
    .bind(detail)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(previous))
}

/// Newest first.
pub async fn health_history(pool: &Db, server_id: Uuid, limit: u32) -> Result<Vec<HealthCheckRecord>> {
    let records = sqlx::query_as::<_, HealthCheckRecord>(
        r#"
        SELECT id, server_id, status, response_time_ms, detail, checked_at
        FROM health_checks
        WHERE server_id = ?1
        ORDER BY id DESC
        LIMIT ?2
        "#,
    )
    .bind(server_id)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn uptime_window(pool: &Db, server_id: Uuid, window: u32) -> Result<UptimeWindow> {
    let counts = sqlx::query_as::<_, UptimeWindow>(
        r#"
        SELECT COUNT(*) AS total,
               COALESCE(SUM(CASE WHEN status = 'online' THEN 1 ELSE 0 END), 0) AS successful
        FROM (
            SELECT status FROM health_checks
            WHERE server_id = ?1
            ORDER BY id DESC
            LIMIT ?2
        )
        "#,
    )
    .bind(server_id)
    .bind(i64::from(window))
    .fetch_one(pool)
    .await?;
    Ok(counts)
}

/// True when the last `count` checks exist and all of them were offline.
pub async fn consecutive_offline(pool: &Db, server_id: Uuid, count: u32) -> Result<bool> {
    if count == 0 {
        return Ok(true);
    }
    let window = uptime_window(pool, server_id, count).await?;
    let offline: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM (
            SELECT status FROM health_checks
            WHERE server_id = ?1
            ORDER BY id DESC
            LIMIT ?2
        )
        WHERE status = 'offline'
        "#,
    )
    .bind(server_id)
    .bind(i64::from(count))
    .fetch_one(pool)
    .await?;
    Ok(window.total == i64::from(count) && offline == window.total)
}

pub async fn prune_health_checks(pool: &Db, older_than: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM health_checks WHERE checked_at < ?1")
        .bind(older_than)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::servers::{create_server, get_server, NewServer};
    use crate::test_support::test_pool;

    #[tokio::test]
    async fn record_health_updates_server_and_appends_history() {
        let pool = test_pool().await;
        let server = create_server(&pool, NewServer::new("a", "10.0.0.1", 5)).await.expect("a");

        let previous = record_health(&pool, server.id, HealthStatus::Offline, None, Some("refused"))
            .await
            .expect("record");
        assert_eq!(previous, Some(HealthStatus::Online));

        let stored = get_server(&pool, server.id).await.expect("get").expect("row");
        assert_eq!(stored.health_status, HealthStatus::Offline);
        assert!(stored.last_health_check.is_some());

        let history = health_history(&pool, server.id, 10).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].detail.as_deref(), Some("refused"));
    }

    #[tokio::test]
    async fn record_health_for_unknown_server_is_none() {
        let pool = test_pool().await;
        let previous = record_health(&pool, Uuid::new_v4(), HealthStatus::Online, Some(3), None)
            .await
            .expect("record");
        assert!(previous.is_none());
    }

    #[tokio::test]
    async fn uptime_uses_only_the_most_recent_window() {
        let pool = test_pool().await;
        let server = create_server(&pool, NewServer::new("a", "10.0.0.1", 5)).await.expect("a");
        for _ in 0..3 {
            record_health(&pool, server.id, HealthStatus::Offline, None, None)
                .await
                .expect("offline");
        }
        for _ in 0..4 {
            record_health(&pool, server.id, HealthStatus::Online, Some(12), None)
                .await
                .expect("online");
        }

        let recent = uptime_window(&pool, server.id, 4).await.expect("window");
        let wide = uptime_window(&pool, server.id, 100).await.expect("window");

        assert_eq!(recent.percentage(), 100.0);
        assert_eq!(wide, UptimeWindow { total: 7, successful: 4 });
        assert_eq!(wide.percentage(), 57.1);
        assert_eq!(UptimeWindow::default().percentage(), 0.0);
    }

    #[tokio::test]
    async fn consecutive_offline_requires_a_full_run() {
        let pool = test_pool().await;
        let server = create_server(&pool, NewServer::new("a", "10.0.0.1", 5)).await.expect("a");

        record_health(&pool, server.id, HealthStatus::Offline, None, None)
            .await
            .expect("offline");
        assert!(!consecutive_offline(&pool, server.id, 2).await.expect("check"));

        record_health(&pool, server.id, HealthStatus::Offline, None, None)
            .await
            .expect("offline");
        assert!(consecutive_offline(&pool, server.id, 2).await.expect("check"));

        record_health(&pool, server.id, HealthStatus::Degraded, None, None)
            .await
            .expect("degraded");
        assert!(!consecutive_offline(&pool, server.id, 2).await.expect("check"));
    }

    #[tokio::test]
    async fn prune_drops_old_records() {
        let pool = test_pool().await;
        let server = create_server(&pool, NewServer::new("a", "10.0.0.1", 5)).await.expect("a");
        record_health(&pool, server.id, HealthStatus::Online, None, None)
            .await
            .expect("record");

        let removed = prune_health_checks(&pool, Utc::now() + chrono::Duration::seconds(1))
            .await
            .expect("prune");
        assert_eq!(removed, 1);
    }
}
