use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{Duration as ChronoDuration, Utc};
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use portwarden_db::models::{Account, ADMIN_USERNAME};
use portwarden_db::repositories::AccountRepository;

use crate::error::{PanelError, PanelResult};
use crate::services::lifecycle_service::{LifecycleService, ServiceStatus};
use crate::services::port_alloc;
use crate::services::sync_service::SyncService;
use crate::settings::Settings;

const ADMIN_TRAFFIC_LIMIT: i64 = 100 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub email: Option<String>,
    pub traffic_limit: i64,
    pub expires_in_days: Option<i64>,
}

fn generate_password() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Account CRUD plus the service orchestration each mutation implies.
pub struct AccountService {
    accounts: AccountRepository,
    lifecycle: Arc<LifecycleService>,
    sync: Arc<SyncService>,
    settings: Settings,
    /// Serializes the port-scan-then-insert window so two concurrent
    /// creations cannot pick the same port. The UNIQUE constraint on the
    /// port column backstops anything that slips past.
    creation_lock: tokio::sync::Mutex<()>,
}

impl AccountService {
    pub fn new(
        accounts: AccountRepository,
        lifecycle: Arc<LifecycleService>,
        sync: Arc<SyncService>,
        settings: Settings,
    ) -> Self {
        Self {
            accounts,
            lifecycle,
            sync,
            settings,
            creation_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn list(&self) -> PanelResult<Vec<Account>> {
        Ok(self.accounts.get_all().await?)
    }

    pub async fn get(&self, username: &str) -> PanelResult<Account> {
        self.accounts
            .get_by_username(username)
            .await?
            .ok_or_else(|| PanelError::AccountNotFound(username.to_string()))
    }

    /// Creates an account on the lowest free port, provisions its service
    /// and folds it into the aggregate config. If provisioning fails the
    /// record is kept so the operator can retry the service bring-up.
    pub async fn create_account(&self, new: NewAccount) -> PanelResult<Account> {
        if new.username.trim().is_empty() {
            return Err(PanelError::Internal(anyhow::anyhow!(
                "username must not be empty"
            )));
        }
        if new.username == ADMIN_USERNAME {
            return Err(PanelError::ProtectedAccount(new.username));
        }
        if self.accounts.get_by_username(&new.username).await?.is_some() {
            return Err(PanelError::DuplicateUsername(new.username));
        }

        let account = {
            let _guard = self.creation_lock.lock().await;
            let used = self.accounts.used_ports().await?;
            let port = port_alloc::lowest_free(
                &used,
                self.settings.port_range_start,
                self.settings.port_range_end,
            )?;
            let now = Utc::now();
            let account = Account {
                id: Uuid::new_v4().to_string(),
                username: new.username,
                email: new.email,
                password: generate_password(),
                port,
                method: self.settings.method.clone(),
                enabled: true,
                traffic_used: 0,
                traffic_limit: new.traffic_limit,
                expires_at: new.expires_in_days.map(|d| now + ChronoDuration::days(d)),
                notified_expire: false,
                notified_traffic: false,
                notified_expired: false,
                created_at: now,
                updated_at: now,
            };
            self.accounts.insert(&account).await?;
            account
        };

        let provisioned = self.lifecycle.provision(&account).await;
        if let Err(e) = &provisioned {
            warn!(username = %account.username, "Provisioning failed, account record kept: {}", e);
        }
        self.sync.reconcile().await?;
        provisioned?;

        info!(username = %account.username, port = account.port, "Created account");
        Ok(account)
    }

    pub async fn delete_account(&self, username: &str) -> PanelResult<()> {
        let account = self.get(username).await?;
        if account.is_admin() {
            return Err(PanelError::ProtectedAccount(account.username));
        }

        self.lifecycle.remove(&account).await?;
        self.accounts.delete(&account.id).await?;
        self.sync.reconcile().await?;
        info!(%username, port = account.port, "Deleted account");
        Ok(())
    }

    /// Enables or disables an account. The service transition runs first;
    /// the flag only flips once the host actually did it.
    pub async fn set_enabled(&self, username: &str, enabled: bool) -> PanelResult<Account> {
        let account = self.get(username).await?;
        if account.is_admin() {
            return Err(PanelError::ProtectedAccount(account.username));
        }
        if account.enabled == enabled {
            return Ok(account);
        }

        let action = if enabled {
            crate::services::host_executor::ServiceAction::Start
        } else {
            crate::services::host_executor::ServiceAction::Stop
        };
        self.lifecycle.manage(action, &account).await?;
        self.accounts.set_enabled(&account.id, enabled).await?;
        self.sync.reconcile().await?;
        self.get(username).await
    }

    pub async fn reset_traffic(&self, username: &str) -> PanelResult<()> {
        let account = self.get(username).await?;
        self.accounts.reset_traffic(&account.id).await?;
        info!(%username, "Traffic counter reset");
        Ok(())
    }

    /// Pushes the expiry `days` further out, from the current expiry when it
    /// is still in the future, otherwise from now. Clears the notified
    /// flags so the extended account gets fresh warnings.
    pub async fn extend(&self, username: &str, days: i64) -> PanelResult<Account> {
        let account = self.get(username).await?;
        let now = Utc::now();
        let base = match account.expires_at {
            Some(at) if at > now => at,
            _ => now,
        };
        self.accounts
            .set_expiration(&account.id, Some(base + ChronoDuration::days(days)))
            .await?;
        info!(%username, days, "Extended account");
        self.get(username).await
    }

    /// Client connection string: `ss://` over the base64 of
    /// `method:password@host:port`, tagged with the username.
    pub fn config_url(&self, account: &Account) -> String {
        let plain = format!(
            "{}:{}@{}:{}",
            account.method, account.password, self.settings.server_ip, account.port
        );
        format!("ss://{}#{}", STANDARD.encode(plain), account.username)
    }

    pub async fn status(&self, username: &str) -> PanelResult<(Account, ServiceStatus)> {
        let account = self.get(username).await?;
        let status = self.lifecycle.status(&account).await;
        Ok((account, status))
    }

    /// Creates the admin aggregate account on first run and makes sure its
    /// multi-port service exists and is up.
    pub async fn ensure_admin(&self) -> PanelResult<Account> {
        let admin = match self.accounts.get_by_username(ADMIN_USERNAME).await? {
            Some(existing) => existing,
            None => {
                let now = Utc::now();
                let admin = Account {
                    id: Uuid::new_v4().to_string(),
                    username: ADMIN_USERNAME.to_string(),
                    email: None,
                    password: generate_password(),
                    port: self.settings.admin_port(),
                    method: self.settings.method.clone(),
                    enabled: true,
                    traffic_used: 0,
                    traffic_limit: ADMIN_TRAFFIC_LIMIT,
                    expires_at: None,
                    notified_expire: false,
                    notified_traffic: false,
                    notified_expired: false,
                    created_at: now,
                    updated_at: now,
                };
                self.accounts.insert(&admin).await?;
                info!(port = admin.port, "Created admin aggregate account");
                admin
            }
        };

        let enabled = self.accounts.get_enabled().await?;
        let port_password: BTreeMap<String, String> = enabled
            .iter()
            .map(|a| (a.port.to_string(), a.password.clone()))
            .collect();
        self.lifecycle.ensure_admin(&admin, &port_password).await?;
        Ok(admin)
    }

    /// Full resync: missing artifacts are recreated, every enabled
    /// account's service is started, every disabled one stopped, then the
    /// aggregate config is rebuilt.
    pub async fn sync_services(&self) -> PanelResult<usize> {
        let accounts = self.accounts.get_all().await?;
        let mut repaired = 0;
        for account in &accounts {
            if account.is_admin() {
                continue;
            }
            if let Err(e) = self.lifecycle.ensure_artifacts(account).await {
                warn!(username = %account.username, "Could not recreate artifacts: {}", e);
                continue;
            }
            let action = if account.enabled {
                crate::services::host_executor::ServiceAction::Start
            } else {
                crate::services::host_executor::ServiceAction::Stop
            };
            match self.lifecycle.manage(action, account).await {
                Ok(_) => repaired += 1,
                Err(e) => warn!(username = %account.username, "Sync skipped account: {}", e),
            }
        }
        self.sync.reconcile().await?;
        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::host_executor::testing::{ok, ScriptedRunner};
    use crate::services::host_executor::HostExecutor;
    use std::path::Path;
    use std::time::Duration;

    fn test_settings(dir: &Path, range: (i64, i64)) -> Settings {
        Settings {
            database_url: String::new(),
            server_ip: "203.0.113.7".into(),
            port_range_start: range.0,
            port_range_end: range.1,
            method: "aes-256-gcm".into(),
            config_dir: dir.join("ss"),
            systemd_dir: dir.join("units"),
            host_root: "/host".into(),
            traffic_chain: "SS_TRAFFIC".into(),
            traffic_interval: Duration::from_secs(30),
            notify_interval: Duration::from_secs(300),
            exec_timeout: Duration::from_secs(5),
        }
    }

    async fn setup(dir: &Path, range: (i64, i64)) -> AccountService {
        let pool = portwarden_db::connect_memory().await.unwrap();
        let repo = AccountRepository::new(pool);
        let runner = Arc::new(ScriptedRunner::new(|_| ok("")));
        let executor = Arc::new(HostExecutor::with_runner(
            runner,
            "/host",
            Duration::from_secs(5),
        ));
        let settings = test_settings(dir, range);
        let lifecycle = Arc::new(LifecycleService::new(executor, &settings));
        let sync = Arc::new(SyncService::new(
            repo.clone(),
            lifecycle.clone(),
            &settings.method,
        ));
        AccountService::new(repo, lifecycle, sync, settings)
    }

    fn new_account(username: &str) -> NewAccount {
        NewAccount {
            username: username.to_string(),
            email: None,
            traffic_limit: 10 * 1024 * 1024 * 1024,
            expires_in_days: Some(30),
        }
    }

    #[tokio::test]
    async fn create_assigns_lowest_free_port_and_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let svc = setup(dir.path(), (8388, 8488)).await;

        let first = svc.create_account(new_account("alfa")).await.unwrap();
        let second = svc.create_account(new_account("bravo")).await.unwrap();

        assert_eq!(first.port, 8388);
        assert_eq!(second.port, 8389);
        assert!(dir.path().join("ss/config-alfa.json").exists());
        assert!(dir.path().join("units/shadowsocks-bravo.service").exists());

        let aggregate =
            std::fs::read_to_string(dir.path().join("ss/config.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&aggregate).unwrap();
        assert!(parsed["port_password"].get("8388").is_some());
        assert!(parsed["port_password"].get("8389").is_some());
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = setup(dir.path(), (8388, 8488)).await;

        svc.create_account(new_account("alfa")).await.unwrap();
        let err = svc.create_account(new_account("alfa")).await.unwrap_err();
        assert!(matches!(err, PanelError::DuplicateUsername(_)));
    }

    #[tokio::test]
    async fn exhausted_range_refuses_creation() {
        let dir = tempfile::tempdir().unwrap();
        let svc = setup(dir.path(), (8388, 8389)).await;

        svc.create_account(new_account("alfa")).await.unwrap();
        svc.create_account(new_account("bravo")).await.unwrap();
        let err = svc.create_account(new_account("charlie")).await.unwrap_err();
        assert!(matches!(err, PanelError::PortExhausted { .. }));
    }

    #[tokio::test]
    async fn deleted_port_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let svc = setup(dir.path(), (8388, 8488)).await;

        svc.create_account(new_account("alfa")).await.unwrap();
        svc.create_account(new_account("bravo")).await.unwrap();
        svc.delete_account("alfa").await.unwrap();

        let replacement = svc.create_account(new_account("charlie")).await.unwrap();
        assert_eq!(replacement.port, 8388);
        assert!(!dir.path().join("ss/config-alfa.json").exists());
    }

    #[tokio::test]
    async fn admin_cannot_be_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let svc = setup(dir.path(), (8388, 8488)).await;

        svc.ensure_admin().await.unwrap();
        let err = svc.delete_account(ADMIN_USERNAME).await.unwrap_err();
        assert!(matches!(err, PanelError::ProtectedAccount(_)));
    }

    #[tokio::test]
    async fn disable_drops_port_from_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let svc = setup(dir.path(), (8388, 8488)).await;

        svc.create_account(new_account("alfa")).await.unwrap();
        let toggled = svc.set_enabled("alfa", false).await.unwrap();
        assert!(!toggled.enabled);

        let aggregate =
            std::fs::read_to_string(dir.path().join("ss/config.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&aggregate).unwrap();
        assert!(parsed["port_password"].get("8388").is_none());
    }

    #[tokio::test]
    async fn extend_moves_expiry_forward_from_the_later_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let svc = setup(dir.path(), (8388, 8488)).await;

        let created = svc.create_account(new_account("alfa")).await.unwrap();
        let extended = svc.extend("alfa", 30).await.unwrap();

        let old = created.expires_at.unwrap();
        let new = extended.expires_at.unwrap();
        assert_eq!((new - old).num_days(), 30);
        assert!(!extended.notified_expire);
    }

    #[tokio::test]
    async fn config_url_encodes_the_connection_string() {
        let dir = tempfile::tempdir().unwrap();
        let svc = setup(dir.path(), (8388, 8488)).await;

        let account = svc.create_account(new_account("alfa")).await.unwrap();
        let url = svc.config_url(&account);

        assert!(url.starts_with("ss://"));
        assert!(url.ends_with("#alfa"));
        let encoded = url
            .strip_prefix("ss://")
            .unwrap()
            .split('#')
            .next()
            .unwrap();
        let decoded = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(
            decoded,
            format!("aes-256-gcm:{}@203.0.113.7:8388", account.password)
        );
    }

    #[tokio::test]
    async fn sync_recreates_missing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let svc = setup(dir.path(), (8388, 8488)).await;

        svc.create_account(new_account("alfa")).await.unwrap();
        let config_path = dir.path().join("ss/config-alfa.json");
        std::fs::remove_file(&config_path).unwrap();

        let repaired = svc.sync_services().await.unwrap();
        assert_eq!(repaired, 1);
        assert!(config_path.exists());
    }

    #[tokio::test]
    async fn ensure_admin_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let svc = setup(dir.path(), (8388, 8488)).await;

        let first = svc.ensure_admin().await.unwrap();
        let second = svc.ensure_admin().await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.port, 8388);
        assert!(dir.path().join("units/shadowsocks.service").exists());
    }
}
