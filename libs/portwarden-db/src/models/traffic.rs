use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Point-in-time usage delta applied to one account. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TrafficSnapshot {
    pub id: i64,
    pub account_id: String,
    pub username: String,
    pub port: i64,
    pub delta_bytes: i64,
    pub recorded_at: DateTime<Utc>,
}

/// One aggregate usage row per calendar day.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DailyUsage {
    pub day: String,
    pub total_used_bytes: i64,
    pub total_limit_bytes: i64,
    pub average_usage_percent: f64,
    pub account_count: i64,
}
