use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use portwarden_db::models::Account;

use crate::error::{PanelError, PanelResult};
use crate::services::host_executor::{ExecOutcome, HostExecutor, ServiceAction};
use crate::settings::Settings;

pub const ADMIN_SERVICE: &str = "shadowsocks.service";

/// Worker process config, one per account instance.
#[derive(Debug, Serialize)]
struct InstanceConfig<'a> {
    server: &'a str,
    server_port: i64,
    password: &'a str,
    method: &'a str,
    timeout: u32,
    fast_open: bool,
    mode: &'a str,
}

/// Aggregate config for the admin multi-port service. `port_password` is a
/// BTreeMap so repeated renders of the same account set are byte-identical.
#[derive(Debug, Serialize)]
struct AggregateConfig<'a> {
    server: &'a str,
    port_password: &'a BTreeMap<String, String>,
    method: &'a str,
    timeout: u32,
    fast_open: bool,
    mode: &'a str,
}

/// Merged view of one account's service, combining on-disk artifacts with
/// what the host service manager reports.
#[derive(Debug, Clone, Copy)]
pub struct ServiceStatus {
    pub unit_exists: bool,
    pub active: bool,
    pub enabled: bool,
}

/// Owns the service artifacts (process configs and unit files) and drives
/// lifecycle transitions through the host executor.
pub struct LifecycleService {
    executor: Arc<HostExecutor>,
    config_dir: PathBuf,
    systemd_dir: PathBuf,
}

impl LifecycleService {
    pub fn new(executor: Arc<HostExecutor>, settings: &Settings) -> Self {
        Self {
            executor,
            config_dir: settings.config_dir.clone(),
            systemd_dir: settings.systemd_dir.clone(),
        }
    }

    pub fn config_path(&self, account: &Account) -> PathBuf {
        self.config_dir.join(account.config_file_name())
    }

    pub fn unit_path(&self, account: &Account) -> PathBuf {
        self.systemd_dir.join(account.service_name())
    }

    fn admin_config_path(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    async fn write_artifact(&self, path: &Path, contents: &str) -> PanelResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| PanelError::ArtifactIo {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|source| PanelError::ArtifactIo {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn remove_artifact(&self, path: &Path) -> PanelResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PanelError::ArtifactIo {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn render_instance_config(account: &Account) -> String {
        let config = InstanceConfig {
            server: "0.0.0.0",
            server_port: account.port,
            password: &account.password,
            method: &account.method,
            timeout: 300,
            fast_open: false,
            mode: "tcp_and_udp",
        };
        // Serialization of a plain struct cannot fail.
        serde_json::to_string_pretty(&config).unwrap_or_default()
    }

    fn render_aggregate_config(method: &str, port_password: &BTreeMap<String, String>) -> String {
        let config = AggregateConfig {
            server: "0.0.0.0",
            port_password,
            method,
            timeout: 300,
            fast_open: false,
            mode: "tcp_and_udp",
        };
        serde_json::to_string_pretty(&config).unwrap_or_default()
    }

    fn render_unit(&self, account: &Account) -> String {
        let config_path = self.config_path(account);
        if account.is_admin() {
            format!(
                "[Unit]\n\
                 Description=Shadowsocks-libev Multi-Port Server\n\
                 After=network.target\n\n\
                 [Service]\n\
                 Type=simple\n\
                 ExecStart=/usr/bin/ss-server -c {} -u\n\
                 Restart=on-failure\n\
                 RestartSec=10s\n\
                 LimitNOFILE=65535\n\n\
                 [Install]\n\
                 WantedBy=multi-user.target\n",
                config_path.display()
            )
        } else {
            format!(
                "[Unit]\n\
                 Description=Shadowsocks-libev Server for {}\n\
                 After=network.target\n\n\
                 [Service]\n\
                 Type=simple\n\
                 ExecStart=/usr/bin/ss-server -c {} -u\n\
                 Restart=on-failure\n\
                 RestartSec=10s\n\
                 User=nobody\n\
                 Group=nogroup\n\
                 LimitNOFILE=32768\n\n\
                 [Install]\n\
                 WantedBy=multi-user.target\n",
                account.username,
                config_path.display()
            )
        }
    }

    /// Writes the aggregate config and reports whether it changed on disk.
    pub async fn write_admin_config(
        &self,
        method: &str,
        port_password: &BTreeMap<String, String>,
    ) -> PanelResult<bool> {
        let rendered = Self::render_aggregate_config(method, port_password);
        let path = self.admin_config_path();
        let previous = tokio::fs::read_to_string(&path).await.ok();
        if previous.as_deref() == Some(rendered.as_str()) {
            return Ok(false);
        }
        self.write_artifact(&path, &rendered).await?;
        Ok(true)
    }

    /// Creates the artifacts for a new account and brings its service up.
    pub async fn provision(&self, account: &Account) -> PanelResult<()> {
        self.write_artifact(&self.config_path(account), &Self::render_instance_config(account))
            .await?;
        self.write_artifact(&self.unit_path(account), &self.render_unit(account))
            .await?;
        self.executor
            .execute(ServiceAction::DaemonReload, None)
            .await;
        self.manage(ServiceAction::Enable, account).await?;
        self.manage(ServiceAction::Start, account).await?;
        info!(username = %account.username, port = account.port, "Provisioned service");
        Ok(())
    }

    /// Runs a lifecycle action against the account's unit. Start, stop and
    /// restart get one retry after a daemon-reload, covering the window
    /// where the unit file exists but the manager has not seen it yet.
    pub async fn manage(
        &self,
        action: ServiceAction,
        account: &Account,
    ) -> PanelResult<ExecOutcome> {
        let service = account.service_name();
        let unit_path = self.unit_path(account);
        if !tokio::fs::try_exists(&unit_path).await.unwrap_or(false) {
            return Err(PanelError::ExecutionFailed {
                action: action.to_string(),
                service,
                stderr: format!("unit file {} does not exist", unit_path.display()),
            });
        }

        let first = self.executor.execute(action, Some(&service)).await;
        if first.success {
            return Ok(first);
        }
        if !action.retryable() {
            return Err(PanelError::ExecutionFailed {
                action: action.to_string(),
                service,
                stderr: first.stderr,
            });
        }

        warn!(%service, %action, "Action failed, reloading units and retrying once");
        self.executor
            .execute(ServiceAction::DaemonReload, None)
            .await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let second = self.executor.execute(action, Some(&service)).await;
        if second.success {
            Ok(second)
        } else {
            Err(PanelError::ExecutionFailed {
                action: action.to_string(),
                service,
                stderr: second.stderr,
            })
        }
    }

    /// Tears the service down and deletes its artifacts. Stop and disable
    /// are best-effort so a half-broken service can still be removed.
    pub async fn remove(&self, account: &Account) -> PanelResult<()> {
        let service = account.service_name();
        let stopped = self.executor.execute(ServiceAction::Stop, Some(&service)).await;
        if !stopped.success {
            warn!(%service, stderr = %stopped.stderr, "Stop failed during removal, continuing");
        }
        let disabled = self
            .executor
            .execute(ServiceAction::Disable, Some(&service))
            .await;
        if !disabled.success {
            warn!(%service, stderr = %disabled.stderr, "Disable failed during removal, continuing");
        }

        self.remove_artifact(&self.unit_path(account)).await?;
        self.remove_artifact(&self.config_path(account)).await?;
        self.executor
            .execute(ServiceAction::DaemonReload, None)
            .await;
        info!(username = %account.username, "Removed service artifacts");
        Ok(())
    }

    /// Rewrites any artifact missing from disk. Returns true when something
    /// had to be recreated, in which case the manager was also reloaded.
    pub async fn ensure_artifacts(&self, account: &Account) -> PanelResult<bool> {
        let mut recreated = false;
        let config_path = self.config_path(account);
        if !tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
            self.write_artifact(&config_path, &Self::render_instance_config(account))
                .await?;
            recreated = true;
        }
        let unit_path = self.unit_path(account);
        if !tokio::fs::try_exists(&unit_path).await.unwrap_or(false) {
            self.write_artifact(&unit_path, &self.render_unit(account))
                .await?;
            recreated = true;
        }
        if recreated {
            warn!(username = %account.username, "Recreated missing service artifacts");
            self.executor
                .execute(ServiceAction::DaemonReload, None)
                .await;
        }
        Ok(recreated)
    }

    /// Makes sure the admin aggregate unit exists and is running.
    pub async fn ensure_admin(
        &self,
        admin: &Account,
        port_password: &BTreeMap<String, String>,
    ) -> PanelResult<()> {
        self.write_admin_config(&admin.method, port_password).await?;
        self.write_artifact(&self.unit_path(admin), &self.render_unit(admin))
            .await?;
        self.executor
            .execute(ServiceAction::DaemonReload, None)
            .await;
        self.manage(ServiceAction::Enable, admin).await?;
        self.manage(ServiceAction::Start, admin).await?;
        Ok(())
    }

    /// Asks the running aggregate service to re-read its config. Never
    /// escalates to a restart: the aggregate carries every multi-port
    /// client, and a restart would drop them all for one stale port.
    pub async fn reload_admin(&self) -> ExecOutcome {
        self.executor
            .execute(ServiceAction::Reload, Some(ADMIN_SERVICE))
            .await
    }

    pub async fn status(&self, account: &Account) -> ServiceStatus {
        let service = account.service_name();
        let unit_exists = tokio::fs::try_exists(&self.unit_path(account))
            .await
            .unwrap_or(false);
        // The manager's answer and a process probe can disagree across the
        // isolation boundary; report running if either sees the worker.
        let manager_active = self
            .executor
            .execute(ServiceAction::Status, Some(&service))
            .await
            .success;
        let active = manager_active || self.executor.probe_worker(&service).await;
        let enabled = tokio::fs::try_exists(
            self.systemd_dir.join("multi-user.target.wants").join(&service),
        )
        .await
        .unwrap_or(false);
        ServiceStatus {
            unit_exists,
            active,
            enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::host_executor::testing::{fail, ok, ScriptedRunner};
    use chrono::Utc;

    fn account(username: &str, port: i64) -> Account {
        let now = Utc::now();
        Account {
            id: format!("id-{}", username),
            username: username.to_string(),
            email: None,
            password: "s3cret".to_string(),
            port,
            method: "aes-256-gcm".to_string(),
            enabled: true,
            traffic_used: 0,
            traffic_limit: 0,
            expires_at: None,
            notified_expire: false,
            notified_traffic: false,
            notified_expired: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn service(
        runner: Arc<ScriptedRunner>,
        config_dir: &Path,
        systemd_dir: &Path,
    ) -> LifecycleService {
        let executor = Arc::new(HostExecutor::with_runner(
            runner,
            "/host",
            Duration::from_secs(5),
        ));
        LifecycleService {
            executor,
            config_dir: config_dir.to_path_buf(),
            systemd_dir: systemd_dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn provision_writes_config_and_unit() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("ss");
        let systemd_dir = dir.path().join("units");
        let runner = Arc::new(ScriptedRunner::new(|_| ok("")));
        let svc = service(runner, &config_dir, &systemd_dir);

        let murzik = account("murzik", 8389);
        svc.provision(&murzik).await.unwrap();

        let config = std::fs::read_to_string(config_dir.join("config-murzik.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();
        assert_eq!(parsed["server_port"], 8389);
        assert_eq!(parsed["password"], "s3cret");
        assert_eq!(parsed["mode"], "tcp_and_udp");
        assert_eq!(parsed["timeout"], 300);

        let unit = std::fs::read_to_string(systemd_dir.join("shadowsocks-murzik.service")).unwrap();
        assert!(unit.contains("config-murzik.json"));
        assert!(unit.contains("Restart=on-failure"));
        assert!(unit.contains("LimitNOFILE=32768"));
    }

    #[tokio::test]
    async fn manage_refuses_unknown_unit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| ok("")));
        let svc = service(runner.clone(), dir.path(), dir.path());

        let err = svc
            .manage(ServiceAction::Start, &account("ghost", 8400))
            .await
            .unwrap_err();
        assert!(matches!(err, PanelError::ExecutionFailed { .. }));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_retries_once_after_daemon_reload() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let dir = tempfile::tempdir().unwrap();
        let systemd_dir = dir.path().to_path_buf();
        std::fs::write(systemd_dir.join("shadowsocks-murzik.service"), "unit").unwrap();

        let starts = Arc::new(AtomicUsize::new(0));
        let counter = starts.clone();
        let runner = Arc::new(ScriptedRunner::new(move |spec| {
            if spec.args.iter().any(|a| a == "start") {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    fail("Unit shadowsocks-murzik.service not found")
                } else {
                    ok("")
                }
            } else {
                ok("")
            }
        }));
        let svc = service(runner, dir.path(), &systemd_dir);

        let outcome = svc
            .manage(ServiceAction::Start, &account("murzik", 8389))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn remove_is_tolerant_of_missing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| fail("Unknown unit")));
        let svc = service(runner, dir.path(), dir.path());

        // Nothing was ever written; removal still succeeds.
        svc.remove(&account("murzik", 8389)).await.unwrap();
    }

    #[tokio::test]
    async fn admin_config_render_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| ok("")));
        let svc = service(runner, dir.path(), dir.path());

        let mut ports = BTreeMap::new();
        ports.insert("8389".to_string(), "pw-a".to_string());
        ports.insert("8390".to_string(), "pw-b".to_string());

        assert!(svc.write_admin_config("aes-256-gcm", &ports).await.unwrap());
        // Same input renders byte-identically, so the second write is a no-op.
        assert!(!svc.write_admin_config("aes-256-gcm", &ports).await.unwrap());

        let config = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();
        assert_eq!(parsed["port_password"]["8389"], "pw-a");
        assert_eq!(parsed["port_password"]["8390"], "pw-b");
    }
}
