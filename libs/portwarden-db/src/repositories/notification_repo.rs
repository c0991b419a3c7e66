use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::notification::{NotificationEvent, NotificationKind};

#[derive(Debug, Clone)]
pub struct NotificationRepository {
    pool: SqlitePool,
}

impl NotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        kind: NotificationKind,
        account_id: &str,
        username: &str,
        message: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_events (kind, account_id, username, message, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(kind.as_str())
        .bind(account_id)
        .bind(username)
        .bind(message)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("Failed to append notification event")?;
        Ok(())
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<NotificationEvent>> {
        sqlx::query_as("SELECT * FROM notification_events ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch notification events")
    }

    pub async fn count_for(&self, account_id: &str, kind: NotificationKind) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM notification_events WHERE account_id = ? AND kind = ?",
        )
        .bind(account_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count notification events")
    }
}
