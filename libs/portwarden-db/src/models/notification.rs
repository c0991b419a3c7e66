use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ExpireSoon,
    TrafficHigh,
    Expired,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ExpireSoon => "expire_soon",
            NotificationKind::TrafficHigh => "traffic_high",
            NotificationKind::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "expire_soon" => Some(NotificationKind::ExpireSoon),
            "traffic_high" => Some(NotificationKind::TrafficHigh),
            "expired" => Some(NotificationKind::Expired),
            _ => None,
        }
    }
}

/// Append-only audit record; emitted at most once per account and kind
/// until the matching notified flag is cleared.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationEvent {
    pub id: i64,
    pub kind: String,
    pub account_id: String,
    pub username: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn kind(&self) -> Option<NotificationKind> {
        NotificationKind::parse(&self.kind)
    }
}
