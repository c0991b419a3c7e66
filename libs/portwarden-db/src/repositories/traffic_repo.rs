use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;

use crate::models::traffic::{DailyUsage, TrafficSnapshot};
use crate::repositories::account_repo::UsageTotals;

#[derive(Debug, Clone)]
pub struct TrafficRepository {
    pool: SqlitePool,
}

impl TrafficRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_snapshot(
        &self,
        account_id: &str,
        username: &str,
        port: i64,
        delta_bytes: i64,
        recorded_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO traffic_snapshots (account_id, username, port, delta_bytes, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(account_id)
        .bind(username)
        .bind(port)
        .bind(delta_bytes)
        .bind(recorded_at)
        .execute(&self.pool)
        .await
        .context("Failed to append traffic snapshot")?;
        Ok(())
    }

    pub async fn snapshots_for_account(
        &self,
        account_id: &str,
        limit: i64,
    ) -> Result<Vec<TrafficSnapshot>> {
        sqlx::query_as(
            "SELECT * FROM traffic_snapshots WHERE account_id = ? ORDER BY recorded_at DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch traffic snapshots")
    }

    pub async fn recent_snapshots(&self, limit: i64) -> Result<Vec<TrafficSnapshot>> {
        sqlx::query_as("SELECT * FROM traffic_snapshots ORDER BY recorded_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch traffic snapshots")
    }

    /// Records the aggregate usage row for `day`; a second call for the same
    /// day is a no-op, so the daily snapshot stays once-per-calendar-day even
    /// across restarts.
    pub async fn record_daily_once(&self, day: NaiveDate, totals: &UsageTotals) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO daily_usage
                (day, total_used_bytes, total_limit_bytes, average_usage_percent, account_count)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(day.format("%Y-%m-%d").to_string())
        .bind(totals.total_used)
        .bind(totals.total_limit)
        .bind(totals.average_usage_percent)
        .bind(totals.account_count)
        .execute(&self.pool)
        .await
        .context("Failed to record daily usage")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn daily_history(&self, days: i64) -> Result<Vec<DailyUsage>> {
        sqlx::query_as("SELECT * FROM daily_usage ORDER BY day DESC LIMIT ?")
            .bind(days)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch daily usage history")
    }
}
