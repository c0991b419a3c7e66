use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::account::Account;
use crate::models::notification::NotificationKind;

/// Aggregate usage over all accounts, for the daily snapshot.
#[derive(Debug, Clone, Copy)]
pub struct UsageTotals {
    pub total_used: i64,
    pub total_limit: i64,
    pub average_usage_percent: f64,
    pub account_count: i64,
}

#[derive(Debug, Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts
                (id, username, email, password, port, method, enabled,
                 traffic_used, traffic_limit, expires_at,
                 notified_expire, notified_traffic, notified_expired,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.username)
        .bind(&account.email)
        .bind(&account.password)
        .bind(account.port)
        .bind(&account.method)
        .bind(account.enabled)
        .bind(account.traffic_used)
        .bind(account.traffic_limit)
        .bind(account.expires_at)
        .bind(account.notified_expire)
        .bind(account.notified_traffic)
        .bind(account.notified_expired)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert account '{}'", account.username))?;
        Ok(())
    }

    pub async fn get_all(&self) -> Result<Vec<Account>> {
        sqlx::query_as("SELECT * FROM accounts ORDER BY port ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch accounts")
    }

    pub async fn get_enabled(&self) -> Result<Vec<Account>> {
        sqlx::query_as("SELECT * FROM accounts WHERE enabled = 1 ORDER BY port ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch enabled accounts")
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Account>> {
        sqlx::query_as("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch account by id")
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<Account>> {
        sqlx::query_as("SELECT * FROM accounts WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch account by username")
    }

    pub async fn get_by_port(&self, port: i64) -> Result<Option<Account>> {
        sqlx::query_as("SELECT * FROM accounts WHERE port = ?")
            .bind(port)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch account by port")
    }

    /// Ports assigned to any account, enabled or not.
    pub async fn used_ports(&self) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT port FROM accounts ORDER BY port ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch assigned ports")
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete account")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE accounts SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update enabled flag")?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomic usage increment; safe against concurrent resets.
    pub async fn increment_traffic(&self, id: &str, delta_bytes: i64) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET traffic_used = traffic_used + ?, updated_at = ? WHERE id = ?",
        )
        .bind(delta_bytes)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to increment traffic usage")?;
        Ok(())
    }

    /// Zeroes usage and re-arms the high-usage notification.
    pub async fn reset_traffic(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE accounts SET traffic_used = 0, notified_traffic = 0, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to reset traffic")?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves the expiry and re-arms every notification for the account, so an
    /// extended account can be warned again as the new expiry approaches.
    pub async fn set_expiration(
        &self,
        id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET expires_at = ?,
                notified_expire = 0,
                notified_traffic = 0,
                notified_expired = 0,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(expires_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update expiration")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_notified(&self, id: &str, kind: NotificationKind) -> Result<()> {
        let column = match kind {
            NotificationKind::ExpireSoon => "notified_expire",
            NotificationKind::TrafficHigh => "notified_traffic",
            NotificationKind::Expired => "notified_expired",
        };
        sqlx::query(&format!(
            "UPDATE accounts SET {} = 1, updated_at = ? WHERE id = ?",
            column
        ))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to set notified flag")?;
        Ok(())
    }

    pub async fn usage_totals(&self) -> Result<UsageTotals> {
        let (total_used, total_limit, account_count): (i64, i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(traffic_used), 0), COALESCE(SUM(traffic_limit), 0), COUNT(*) FROM accounts",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to aggregate usage")?;

        // COALESCE must fall back to a REAL literal: an INTEGER 0 from an
        // empty AVG does not decode into f64.
        let average_ratio: f64 = sqlx::query_scalar(
            "SELECT COALESCE(AVG(CAST(traffic_used AS REAL) / traffic_limit), 0.0) FROM accounts WHERE traffic_limit > 0",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute average usage")?;

        Ok(UsageTotals {
            total_used,
            total_limit,
            average_usage_percent: average_ratio * 100.0,
            account_count,
        })
    }
}
