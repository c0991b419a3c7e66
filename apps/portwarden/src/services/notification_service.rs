use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use portwarden_db::models::{Account, NotificationKind};
use portwarden_db::repositories::{AccountRepository, NotificationRepository, TrafficRepository};

use crate::error::PanelResult;
use crate::services::sync_service::SyncService;

const EXPIRE_SOON_DAYS: i64 = 3;
const TRAFFIC_HIGH_RATIO: f64 = 0.90;

/// Delivery channel for account warnings. The default implementation
/// writes to the log; the trait is the seam for a real channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: NotificationKind, account: &Account, message: &str)
        -> Result<()>;
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        kind: NotificationKind,
        account: &Account,
        message: &str,
    ) -> Result<()> {
        info!(kind = kind.as_str(), username = %account.username, "{}", message);
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub expire_soon: usize,
    pub traffic_high: usize,
    pub expired: usize,
    pub daily_recorded: bool,
}

/// Periodic engine watching expiry dates and traffic limits. Each warning
/// fires at most once per account, tracked by the notified flags on the
/// account row; resets and extensions re-arm them.
pub struct NotificationService {
    accounts: AccountRepository,
    notifications: NotificationRepository,
    traffic: TrafficRepository,
    notifier: Box<dyn Notifier>,
    sync: Arc<SyncService>,
    interval: Duration,
}

impl NotificationService {
    pub fn new(
        accounts: AccountRepository,
        notifications: NotificationRepository,
        traffic: TrafficRepository,
        notifier: Box<dyn Notifier>,
        sync: Arc<SyncService>,
        interval: Duration,
    ) -> Self {
        Self {
            accounts,
            notifications,
            traffic,
            notifier,
            sync,
            interval,
        }
    }

    async fn fire(
        &self,
        kind: NotificationKind,
        account: &Account,
        message: String,
    ) -> Result<()> {
        self.notifier.notify(kind, account, &message).await?;
        self.notifications
            .insert(kind, &account.id, &account.username, &message, Utc::now())
            .await?;
        self.accounts.mark_notified(&account.id, kind).await?;
        Ok(())
    }

    /// One evaluation pass over the enabled accounts. A failure on one
    /// account is logged and does not stop the rest of the pass.
    pub async fn tick(&self) -> PanelResult<NotifyReport> {
        let now = Utc::now();
        let enabled = self.accounts.get_enabled().await?;
        let mut report = NotifyReport::default();

        for account in &enabled {
            if account.is_admin() {
                continue;
            }

            if !account.notified_expire {
                if let Some(at) = account.expires_at {
                    if at > now && at <= now + ChronoDuration::days(EXPIRE_SOON_DAYS) {
                        let days = account.days_remaining(now).unwrap_or(0);
                        let message = format!(
                            "Account {} expires in {} day(s)",
                            account.username, days
                        );
                        match self.fire(NotificationKind::ExpireSoon, account, message).await {
                            Ok(()) => report.expire_soon += 1,
                            Err(e) => warn!(username = %account.username, "Expiry warning failed: {}", e),
                        }
                    }
                }
            }

            if !account.notified_traffic {
                if let Some(ratio) = account.usage_ratio() {
                    if ratio > TRAFFIC_HIGH_RATIO {
                        let message = format!(
                            "Account {} used {:.1}% of its traffic limit",
                            account.username,
                            ratio * 100.0
                        );
                        match self.fire(NotificationKind::TrafficHigh, account, message).await {
                            Ok(()) => report.traffic_high += 1,
                            Err(e) => warn!(username = %account.username, "Traffic warning failed: {}", e),
                        }
                    }
                }
            }

            if let Some(at) = account.expires_at {
                if at <= now {
                    let mut flagged = account.notified_expired;
                    if !flagged {
                        let message =
                            format!("Account {} expired and was disabled", account.username);
                        match self.fire(NotificationKind::Expired, account, message).await {
                            Ok(()) => {
                                flagged = true;
                                report.expired += 1;
                            }
                            Err(e) => warn!(username = %account.username, "Expiry handling failed, will retry: {}", e),
                        }
                    }
                    // Disable only once the event is on record. A failed
                    // emission leaves the account enabled so the next pass
                    // retries it; a failed disable also retries, because a
                    // flagged-but-enabled account lands here again.
                    if flagged {
                        if let Err(e) = self.accounts.set_enabled(&account.id, false).await {
                            warn!(username = %account.username, "Could not disable expired account: {}", e);
                        }
                    }
                }
            }
        }

        if report.expired > 0 {
            self.sync.reconcile().await?;
        }

        let totals = self.accounts.usage_totals().await?;
        report.daily_recorded = self
            .traffic
            .record_daily_once(Local::now().date_naive(), &totals)
            .await?;
        if report.daily_recorded {
            info!(
                accounts = totals.account_count,
                total_used = totals.total_used,
                "Recorded daily usage snapshot"
            );
        }

        Ok(report)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "Notification engine started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if report.expire_soon + report.traffic_high + report.expired > 0 => {
                            info!(
                                expire_soon = report.expire_soon,
                                traffic_high = report.traffic_high,
                                expired = report.expired,
                                "Notification pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("Notification pass failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Notification engine stopped");
                    return;
                }
            }
        }
    }
}
