use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use portwarden_db::models::Account;
use portwarden_db::repositories::AccountRepository;

use crate::error::PanelResult;
use crate::services::lifecycle_service::LifecycleService;

/// Keeps the admin aggregate service in step with the account table. Every
/// mutation that changes the set of enabled accounts calls `reconcile`.
pub struct SyncService {
    accounts: AccountRepository,
    lifecycle: Arc<LifecycleService>,
    method: String,
}

impl SyncService {
    pub fn new(accounts: AccountRepository, lifecycle: Arc<LifecycleService>, method: &str) -> Self {
        Self {
            accounts,
            lifecycle,
            method: method.to_string(),
        }
    }

    fn port_password(accounts: &[Account]) -> BTreeMap<String, String> {
        accounts
            .iter()
            .map(|a| (a.port.to_string(), a.password.clone()))
            .collect()
    }

    /// Rebuilds the aggregate config from the enabled accounts and asks the
    /// admin service to pick it up. A reload failure is logged, not
    /// returned: the account mutation that triggered the reconcile already
    /// happened and must not be rolled back over a reload hiccup.
    pub async fn reconcile(&self) -> PanelResult<usize> {
        let enabled = self.accounts.get_enabled().await?;
        let port_password = Self::port_password(&enabled);
        let count = port_password.len();

        let changed = self
            .lifecycle
            .write_admin_config(&self.method, &port_password)
            .await?;
        if !changed {
            info!(ports = count, "Aggregate config already current");
            return Ok(count);
        }

        let outcome = self.lifecycle.reload_admin().await;
        if outcome.success {
            info!(ports = count, "Aggregate config reconciled");
        } else {
            warn!(stderr = %outcome.stderr, "Aggregate service did not pick up new config");
        }
        Ok(count)
    }
}
