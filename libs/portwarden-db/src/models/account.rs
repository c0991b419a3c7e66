use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The reserved multi-port aggregate account. Its service carries every
/// enabled account's port and is provisioned once at startup.
pub const ADMIN_USERNAME: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub password: String,
    pub port: i64,
    pub method: String,
    pub enabled: bool,
    pub traffic_used: i64,
    pub traffic_limit: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub notified_expire: bool,
    pub notified_traffic: bool,
    pub notified_expired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn is_admin(&self) -> bool {
        self.username == ADMIN_USERNAME
    }

    /// systemd unit name for this account's worker service.
    pub fn service_name(&self) -> String {
        if self.is_admin() {
            "shadowsocks.service".to_string()
        } else {
            format!("shadowsocks-{}.service", self.username)
        }
    }

    /// File name of the worker's process-config artifact.
    pub fn config_file_name(&self) -> String {
        if self.is_admin() {
            "config.json".to_string()
        } else {
            format!("config-{}.json", self.username)
        }
    }

    /// Usage as a fraction of the limit; `None` when the limit is 0 (unlimited).
    pub fn usage_ratio(&self) -> Option<f64> {
        if self.traffic_limit > 0 {
            Some(self.traffic_used as f64 / self.traffic_limit as f64)
        } else {
            None
        }
    }

    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at.map(|at| (at - now).num_days().max(0))
    }
}
