use chrono::Utc;
use uuid::Uuid;

use super::Db;
use crate::Result;

pub async fn get_api_secret(pool: &Db, server_id: Uuid) -> Result<Option<String>> {
    let secret = sqlx::query_scalar("SELECT api_secret FROM server_credentials WHERE server_id = ?1")
        .bind(server_id)
        .fetch_optional(pool)
        .await?;
    Ok(secret)
}

pub async fn put_api_secret(pool: &Db, server_id: Uuid, secret: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO server_credentials (server_id, api_secret, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (server_id) DO UPDATE SET
            api_secret = excluded.api_secret,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(server_id)
    .bind(secret)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}
