use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::settings::Settings;

/// Service-manager actions the controller can issue against the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
    Reload,
    DaemonReload,
    Status,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
            ServiceAction::Reload => "reload",
            ServiceAction::DaemonReload => "daemon-reload",
            ServiceAction::Status => "status",
        }
    }

    /// Actions that get one retry after a daemon-reload.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ServiceAction::Start | ServiceAction::Stop | ServiceAction::Restart
        )
    }

    /// Only start/stop can fall back to signalling the worker process
    /// directly; a signal cannot answer a status query.
    fn allows_signal_fallback(&self) -> bool {
        matches!(self, ServiceAction::Start | ServiceAction::Stop)
    }
}

impl std::fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which rung of the fallback chain produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    NamespaceEntry,
    BusProbe,
    ProcessSignal,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub strategy: Strategy,
}

/// One subprocess invocation, fully described so tests can script it.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            envs: Vec::new(),
        }
    }

    fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct RawOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Subprocess boundary. The production runner shells out; tests substitute
/// a scripted implementation to drive the strategy chain.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<RawOutput>;
}

pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<RawOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.output();
        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| anyhow::anyhow!("command timed out after {}s", timeout.as_secs()))??;

        Ok(RawOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Candidate bus sockets, relative to the mounted host root.
const BUS_SOCKET_PATHS: [&str; 3] = [
    "run/systemd/private",
    "run/dbus/system_bus_socket",
    "var/run/dbus/system_bus_socket",
];

fn bus_unreachable(stderr: &str) -> bool {
    stderr.contains("Failed to connect to bus")
}

/// Derives the pgrep pattern for a unit's worker process from the config
/// file its command line references.
fn config_pattern_for(service: &str) -> String {
    if service == "shadowsocks.service" {
        return "config.json".to_string();
    }
    let username = service
        .trim_start_matches("shadowsocks-")
        .trim_end_matches(".service");
    format!("config-{}.json", username)
}

/// Executes service-manager commands on the host from inside the container,
/// walking an ordered chain of strategies until one succeeds.
pub struct HostExecutor {
    runner: Arc<dyn CommandRunner>,
    host_root: PathBuf,
    timeout: Duration,
}

impl HostExecutor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            runner: Arc::new(SystemRunner),
            host_root: settings.host_root.clone(),
            timeout: settings.exec_timeout,
        }
    }

    pub fn with_runner(
        runner: Arc<dyn CommandRunner>,
        host_root: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            host_root: host_root.into(),
            timeout,
        }
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    fn systemctl_spec(action: ServiceAction, service: Option<&str>) -> CommandSpec {
        let mut spec = CommandSpec::new("systemctl", &[action.as_str()]);
        if let Some(service) = service {
            spec.args.push(service.to_string());
        }
        spec
    }

    fn nsenter_spec(action: ServiceAction, service: Option<&str>) -> CommandSpec {
        let mut spec = CommandSpec::new(
            "nsenter",
            &["-t", "1", "-m", "-u", "-n", "-i", "systemctl", action.as_str()],
        );
        if let Some(service) = service {
            spec.args.push(service.to_string());
        }
        spec
    }

    async fn attempt(&self, strategy: Strategy, spec: &CommandSpec) -> ExecOutcome {
        info!(?strategy, "Executing on host: {}", spec.display());
        match self.runner.run(spec, self.timeout).await {
            Ok(raw) => {
                if !raw.success {
                    warn!(?strategy, stderr = %raw.stderr, "Host command failed");
                }
                ExecOutcome {
                    success: raw.success,
                    stdout: raw.stdout,
                    stderr: raw.stderr,
                    strategy,
                }
            }
            Err(e) => {
                warn!(?strategy, "Host command error: {}", e);
                ExecOutcome {
                    success: false,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    strategy,
                }
            }
        }
    }

    async fn probe_bus_socket(&self) -> Option<String> {
        for rel in BUS_SOCKET_PATHS {
            let candidate = self.host_root.join(rel);
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                info!("D-Bus socket found at {}", candidate.display());
                return Some(format!("unix:path={}", candidate.display()));
            }
        }
        warn!("No D-Bus sockets found under {}", self.host_root.display());
        None
    }

    async fn signal_fallback(&self, action: ServiceAction, service: &str) -> ExecOutcome {
        let host_root = self.host_root.to_string_lossy().to_string();
        match action {
            ServiceAction::Stop => {
                let pattern = format!("ss-server.*{}", config_pattern_for(service));
                let pgrep =
                    CommandSpec::new("chroot", &[&host_root, "pgrep", "-f", &pattern]);
                let found = self.attempt(Strategy::ProcessSignal, &pgrep).await;
                let pid = found.stdout.lines().next().unwrap_or("").trim().to_string();
                if !found.success || pid.is_empty() {
                    return ExecOutcome {
                        success: false,
                        stdout: String::new(),
                        stderr: format!("no worker process matched '{}'", pattern),
                        strategy: Strategy::ProcessSignal,
                    };
                }
                let kill = CommandSpec::new("chroot", &[&host_root, "kill", &pid]);
                let mut outcome = self.attempt(Strategy::ProcessSignal, &kill).await;
                if outcome.success {
                    outcome.stdout = format!("sent kill signal to PID {}", pid);
                }
                outcome
            }
            ServiceAction::Start => {
                let spec = CommandSpec::new(
                    "chroot",
                    &[&host_root, "systemctl", "start", "--no-block", service],
                );
                self.attempt(Strategy::ProcessSignal, &spec).await
            }
            _ => unreachable!("signal fallback gated by allows_signal_fallback"),
        }
    }

    /// Looks for a live worker process for `service` via the host's pgrep,
    /// matched on the config file its command line references.
    pub async fn probe_worker(&self, service: &str) -> bool {
        let host_root = self.host_root.to_string_lossy().to_string();
        let pattern = format!("ss-server.*{}", config_pattern_for(service));
        let spec = CommandSpec::new("chroot", &[&host_root, "pgrep", "-f", &pattern]);
        match self.runner.run(&spec, self.timeout).await {
            Ok(raw) => raw.success && !raw.stdout.trim().is_empty(),
            Err(_) => false,
        }
    }

    /// Runs `action` against the host, trying each strategy in order and
    /// stopping at the first success. The returned outcome carries the raw
    /// output of whichever attempt settled the call.
    pub async fn execute(&self, action: ServiceAction, service: Option<&str>) -> ExecOutcome {
        let direct = self
            .attempt(Strategy::Direct, &Self::systemctl_spec(action, service))
            .await;
        if direct.success {
            return direct;
        }

        let entered = self
            .attempt(
                Strategy::NamespaceEntry,
                &Self::nsenter_spec(action, service),
            )
            .await;
        if entered.success {
            return entered;
        }
        let mut last = entered;

        if bus_unreachable(&direct.stderr) || bus_unreachable(&last.stderr) {
            if let Some(address) = self.probe_bus_socket().await {
                let mut spec = Self::nsenter_spec(action, service);
                spec.envs
                    .push(("DBUS_SYSTEM_BUS_ADDRESS".to_string(), address));
                let retried = self.attempt(Strategy::BusProbe, &spec).await;
                if retried.success {
                    return retried;
                }
                last = retried;
            }
        }

        if action.allows_signal_fallback() {
            if let Some(service) = service {
                let signalled = self.signal_fallback(action, service).await;
                if signalled.success {
                    return signalled;
                }
                last = signalled;
            }
        }

        last
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn executor(runner: Arc<ScriptedRunner>, host_root: &Path) -> HostExecutor {
        HostExecutor::with_runner(runner, host_root, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn direct_success_stops_the_chain() {
        let runner = Arc::new(ScriptedRunner::new(|_| ok("")));
        let exec = executor(runner.clone(), Path::new("/host"));

        let outcome = exec
            .execute(ServiceAction::Start, Some("shadowsocks-murzik.service"))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.strategy, Strategy::Direct);
        assert_eq!(runner.call_count(), 1);
    }

    #[tokio::test]
    async fn bus_error_falls_through_to_namespace_entry() {
        let runner = Arc::new(ScriptedRunner::new(|spec| {
            if spec.program == "systemctl" {
                fail("Failed to connect to bus: No such file or directory")
            } else {
                ok("")
            }
        }));
        let exec = executor(runner.clone(), Path::new("/host"));

        let outcome = exec
            .execute(ServiceAction::Start, Some("shadowsocks-murzik.service"))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.strategy, Strategy::NamespaceEntry);
        // Strategies 3 and 4 must not run once namespace entry succeeds.
        assert_eq!(runner.call_count(), 2);
    }

    #[tokio::test]
    async fn bus_probe_retries_namespace_entry_with_bus_address() {
        let host_root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(host_root.path().join("run/systemd")).unwrap();
        std::fs::write(host_root.path().join("run/systemd/private"), b"").unwrap();

        let runner = Arc::new(ScriptedRunner::new(|spec| {
            if spec.envs.iter().any(|(k, _)| k == "DBUS_SYSTEM_BUS_ADDRESS") {
                ok("")
            } else {
                fail("Failed to connect to bus: Connection refused")
            }
        }));
        let exec = executor(runner.clone(), host_root.path());

        let outcome = exec
            .execute(ServiceAction::Reload, Some("shadowsocks.service"))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.strategy, Strategy::BusProbe);
        let calls = runner.calls.lock().unwrap();
        let (_, addr) = calls[2]
            .envs
            .iter()
            .find(|(k, _)| k == "DBUS_SYSTEM_BUS_ADDRESS")
            .unwrap()
            .clone();
        assert!(addr.ends_with("run/systemd/private"));
        assert!(addr.starts_with("unix:path="));
    }

    #[tokio::test]
    async fn stop_falls_back_to_killing_the_worker() {
        let runner = Arc::new(ScriptedRunner::new(|spec| {
            if spec.args.iter().any(|a| a == "pgrep") {
                ok("4242\n4243")
            } else if spec.args.iter().any(|a| a == "kill") {
                ok("")
            } else {
                fail("Unknown unit")
            }
        }));
        let exec = executor(runner.clone(), Path::new("/host"));

        let outcome = exec
            .execute(ServiceAction::Stop, Some("shadowsocks-murzik.service"))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.strategy, Strategy::ProcessSignal);
        assert!(outcome.stdout.contains("4242"));

        let calls = runner.calls.lock().unwrap();
        let pgrep = calls.iter().find(|c| c.args.iter().any(|a| a == "pgrep"));
        assert!(
            pgrep
                .unwrap()
                .args
                .iter()
                .any(|a| a.contains("config-murzik.json"))
        );
    }

    #[tokio::test]
    async fn status_never_uses_the_signal_fallback() {
        let runner = Arc::new(ScriptedRunner::new(|_| fail("Unknown unit")));
        let exec = executor(runner.clone(), Path::new("/host"));

        let outcome = exec
            .execute(ServiceAction::Status, Some("shadowsocks-murzik.service"))
            .await;

        assert!(!outcome.success);
        let calls = runner.calls.lock().unwrap();
        assert!(calls.iter().all(|c| !c.args.iter().any(|a| a == "pgrep")));
    }

    #[tokio::test]
    async fn enable_failure_reports_last_error() {
        let runner = Arc::new(ScriptedRunner::new(|_| fail("permission denied")));
        let exec = executor(runner.clone(), Path::new("/host"));

        let outcome = exec
            .execute(ServiceAction::Enable, Some("shadowsocks-murzik.service"))
            .await;

        assert!(!outcome.success);
        assert!(outcome.stderr.contains("permission denied"));
        // Direct then namespace entry only: no bus socket, no signal fallback.
        assert_eq!(runner.call_count(), 2);
    }
}
