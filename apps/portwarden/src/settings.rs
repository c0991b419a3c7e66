use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loaded once at startup from the environment
/// (`.env` is applied by `main` before this runs).
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    /// Public address written into client config strings.
    pub server_ip: String,
    pub port_range_start: i64,
    pub port_range_end: i64,
    pub method: String,
    /// Where per-account worker config artifacts are written.
    pub config_dir: PathBuf,
    /// Where service unit files are written.
    pub systemd_dir: PathBuf,
    /// Host root filesystem, bind-mounted read-only into the container.
    pub host_root: PathBuf,
    /// iptables chain carrying the per-port byte counters.
    pub traffic_chain: String,
    pub traffic_interval: Duration,
    pub notify_interval: Duration,
    pub exec_timeout: Duration,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn var_i64(key: &str, default: i64) -> Result<i64> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("{} must be an integer, got '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let settings = Self {
            database_url: var_or("DATABASE_URL", "sqlite://portwarden.db"),
            server_ip: var_or("SERVER_IP", ""),
            port_range_start: var_i64("PORT_RANGE_START", 8388)?,
            port_range_end: var_i64("PORT_RANGE_END", 8488)?,
            method: var_or("METHOD", "aes-256-gcm"),
            config_dir: PathBuf::from(var_or("CONFIG_DIR", "/etc/shadowsocks-libev")),
            systemd_dir: PathBuf::from(var_or("SYSTEMD_DIR", "/etc/systemd/system")),
            host_root: PathBuf::from(var_or("HOST_ROOT", "/host")),
            traffic_chain: var_or("TRAFFIC_CHAIN", "SS_TRAFFIC"),
            traffic_interval: Duration::from_secs(var_i64("TRAFFIC_INTERVAL_SECS", 30)? as u64),
            notify_interval: Duration::from_secs(var_i64("NOTIFY_INTERVAL_SECS", 300)? as u64),
            exec_timeout: Duration::from_secs(var_i64("EXEC_TIMEOUT_SECS", 30)? as u64),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.port_range_start >= self.port_range_end {
            errors.push("PORT_RANGE_START must be less than PORT_RANGE_END".to_string());
        }
        if !(1..=65535).contains(&self.port_range_start) || !(1..=65535).contains(&self.port_range_end)
        {
            errors.push("port range must fall within 1-65535".to_string());
        }
        if self.server_ip == "0.0.0.0" {
            errors.push("SERVER_IP must be the public address, not 0.0.0.0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Configuration errors: {}", errors.join(", ")))
        }
    }

    /// The admin aggregate service listens on the first port of the range.
    pub fn admin_port(&self) -> i64 {
        self.port_range_start
    }
}
