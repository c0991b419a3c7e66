use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use portwarden_db::repositories::{AccountRepository, TrafficRepository};

use crate::error::{PanelError, PanelResult};
use crate::services::host_executor::{CommandRunner, CommandSpec};

/// Cumulative per-port byte counters read from the host firewall.
#[async_trait]
pub trait CounterSource: Send + Sync {
    async fn read_counters(&self) -> PanelResult<HashMap<i64, i64>>;
}

/// Parses `iptables -nvx -L <chain>` output. Counter rows carry at least
/// ten columns with cumulative bytes in the second and the matched port in
/// an `spt:<port>` token; TCP and UDP rows for the same port are summed.
pub fn parse_counters(output: &str) -> HashMap<i64, i64> {
    let mut counters: HashMap<i64, i64> = HashMap::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }
        let Ok(bytes) = parts[1].parse::<i64>() else {
            continue;
        };
        let Some(port) = parts.iter().find_map(|p| {
            p.rsplit_once("spt:")
                .and_then(|(_, port)| port.parse::<i64>().ok())
        }) else {
            continue;
        };
        *counters.entry(port).or_insert(0) += bytes;
    }
    counters
}

pub struct IptablesCounterSource {
    runner: Arc<dyn CommandRunner>,
    chain: String,
    timeout: Duration,
}

impl IptablesCounterSource {
    pub fn new(runner: Arc<dyn CommandRunner>, chain: &str, timeout: Duration) -> Self {
        Self {
            runner,
            chain: chain.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl CounterSource for IptablesCounterSource {
    async fn read_counters(&self) -> PanelResult<HashMap<i64, i64>> {
        let spec = CommandSpec::new("iptables", &["-nvx", "-L", &self.chain]);
        let raw = self
            .runner
            .run(&spec, self.timeout)
            .await
            .map_err(|e| PanelError::CounterSourceUnavailable(e.to_string()))?;
        if !raw.success {
            return Err(PanelError::CounterSourceUnavailable(raw.stderr));
        }
        Ok(parse_counters(&raw.stdout))
    }
}

/// What one accounting pass applied to the store.
#[derive(Debug, Default)]
pub struct TickReport {
    pub applied: usize,
    pub anomalies: usize,
    pub unowned_ports: usize,
    pub skipped: usize,
}

/// Periodic accounting engine. Keeps an in-memory baseline of the last
/// observed cumulative counters and applies only the positive deltas, so a
/// restart never double-counts traffic.
pub struct TrafficService {
    accounts: AccountRepository,
    traffic: TrafficRepository,
    source: Box<dyn CounterSource>,
    baselines: HashMap<i64, i64>,
    interval: Duration,
}

impl TrafficService {
    pub fn new(
        accounts: AccountRepository,
        traffic: TrafficRepository,
        source: Box<dyn CounterSource>,
        interval: Duration,
    ) -> Self {
        Self {
            accounts,
            traffic,
            source,
            baselines: HashMap::new(),
            interval,
        }
    }

    /// One accounting pass. A port seen for the first time only seeds the
    /// baseline; a counter at or below its baseline is treated as a reset
    /// and skipped rather than applied as a negative delta.
    pub async fn tick(&mut self) -> PanelResult<TickReport> {
        let counters = self.source.read_counters().await?;
        let accounts = self.accounts.get_all().await?;
        let by_port: HashMap<i64, _> = accounts.iter().map(|a| (a.port, a)).collect();

        let mut report = TickReport::default();
        let now = Utc::now();

        for (&port, &current) in &counters {
            let Some(&previous) = self.baselines.get(&port) else {
                debug!(port, current, "Seeding counter baseline");
                continue;
            };
            let delta = current - previous;
            if delta < 0 {
                warn!(port, previous, current, "Counter went backwards, skipping delta");
                report.anomalies += 1;
                continue;
            }
            if delta == 0 {
                continue;
            }
            let Some(account) = by_port.get(&port) else {
                warn!(port, delta, "Traffic on a port no account owns");
                report.unowned_ports += 1;
                continue;
            };
            // A store failure on one port must not abort the cycle: earlier
            // deltas are already applied, and bailing here would skip the
            // baseline replacement below and re-charge them next tick.
            if let Err(e) = self.accounts.increment_traffic(&account.id, delta).await {
                warn!(port, delta, "Could not apply traffic delta: {}", e);
                report.skipped += 1;
                continue;
            }
            if let Err(e) = self
                .traffic
                .insert_snapshot(&account.id, &account.username, port, delta, now)
                .await
            {
                warn!(port, delta, "Delta applied but snapshot not recorded: {}", e);
            }
            report.applied += 1;
        }

        // Replace wholesale so removed rules also drop their baselines.
        self.baselines = counters;
        Ok(report)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "Traffic accounting started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if report.applied > 0 => {
                            info!(applied = report.applied, "Applied traffic deltas");
                        }
                        Ok(_) => {}
                        Err(e) => error!("Traffic pass failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Traffic accounting stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use portwarden_db::models::Account;
    use std::sync::Mutex;

    struct FakeSource {
        readings: Mutex<Vec<HashMap<i64, i64>>>,
    }

    impl FakeSource {
        fn new(readings: Vec<HashMap<i64, i64>>) -> Box<Self> {
            Box::new(Self {
                readings: Mutex::new(readings),
            })
        }
    }

    #[async_trait]
    impl CounterSource for FakeSource {
        async fn read_counters(&self) -> PanelResult<HashMap<i64, i64>> {
            let mut readings = self.readings.lock().unwrap();
            if readings.is_empty() {
                Err(PanelError::CounterSourceUnavailable("exhausted".into()))
            } else {
                Ok(readings.remove(0))
            }
        }
    }

    fn account(username: &str, port: i64) -> Account {
        let now = Utc::now();
        Account {
            id: format!("id-{}", username),
            username: username.to_string(),
            email: None,
            password: "pw".to_string(),
            port,
            method: "aes-256-gcm".to_string(),
            enabled: true,
            traffic_used: 0,
            traffic_limit: 0,
            expires_at: Some(now + ChronoDuration::days(30)),
            notified_expire: false,
            notified_traffic: false,
            notified_expired: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn counters(pairs: &[(i64, i64)]) -> HashMap<i64, i64> {
        pairs.iter().copied().collect()
    }

    async fn service_with(
        readings: Vec<HashMap<i64, i64>>,
    ) -> (TrafficService, AccountRepository) {
        let pool = portwarden_db::connect_memory().await.unwrap();
        let accounts = AccountRepository::new(pool.clone());
        let traffic = TrafficRepository::new(pool);
        let svc = TrafficService::new(
            accounts.clone(),
            traffic,
            FakeSource::new(readings),
            Duration::from_secs(30),
        );
        (svc, accounts)
    }

    #[test]
    fn parses_counter_rows_and_sums_protocols() {
        let output = "\
Chain SS_TRAFFIC (1 references)
    pkts      bytes target     prot opt in     out     source               destination
    1024  5000000            tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            tcp spt:8389
     512  2500000            udp  --  *      *       0.0.0.0/0            0.0.0.0/0            udp spt:8389
     256  1000000            tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            tcp spt:8390
short line
";
        let parsed = parse_counters(output);
        assert_eq!(parsed.get(&8389), Some(&7_500_000));
        assert_eq!(parsed.get(&8390), Some(&1_000_000));
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn first_sight_seeds_baseline_without_charging() {
        let (mut svc, accounts) = service_with(vec![
            counters(&[(8389, 5_000_000)]),
            counters(&[(8389, 5_750_000)]),
        ])
        .await;
        accounts.insert(&account("murzik", 8389)).await.unwrap();

        let first = svc.tick().await.unwrap();
        assert_eq!(first.applied, 0);
        assert_eq!(
            accounts.get_by_id("id-murzik").await.unwrap().unwrap().traffic_used,
            0
        );

        let second = svc.tick().await.unwrap();
        assert_eq!(second.applied, 1);
        assert_eq!(
            accounts.get_by_id("id-murzik").await.unwrap().unwrap().traffic_used,
            750_000
        );
    }

    #[tokio::test]
    async fn counter_reset_is_skipped_then_resumes() {
        let (mut svc, accounts) = service_with(vec![
            counters(&[(8389, 5_000_000)]),
            counters(&[(8389, 100)]),
            counters(&[(8389, 600)]),
        ])
        .await;
        accounts.insert(&account("murzik", 8389)).await.unwrap();

        svc.tick().await.unwrap();
        let reset = svc.tick().await.unwrap();
        assert_eq!(reset.applied, 0);
        assert_eq!(reset.anomalies, 1);

        // The reset reading became the new baseline, so growth from it counts.
        let resumed = svc.tick().await.unwrap();
        assert_eq!(resumed.applied, 1);
        assert_eq!(
            accounts.get_by_id("id-murzik").await.unwrap().unwrap().traffic_used,
            500
        );
    }

    #[tokio::test]
    async fn store_failure_mid_tick_does_not_recharge_deltas() {
        let pool = portwarden_db::connect_memory().await.unwrap();
        let accounts = AccountRepository::new(pool.clone());
        let traffic = TrafficRepository::new(pool.clone());
        let mut svc = TrafficService::new(
            accounts.clone(),
            traffic,
            FakeSource::new(vec![
                counters(&[(8389, 1_000_000)]),
                counters(&[(8389, 1_500_000)]),
                counters(&[(8389, 1_500_000)]),
            ]),
            Duration::from_secs(30),
        );
        accounts.insert(&account("murzik", 8389)).await.unwrap();

        svc.tick().await.unwrap();

        // Snapshot writes start failing; the delta still lands exactly once
        // and the baseline moves on.
        sqlx::query("DROP TABLE traffic_snapshots")
            .execute(&pool)
            .await
            .unwrap();
        let report = svc.tick().await.unwrap();
        assert_eq!(report.applied, 1);

        let unchanged = svc.tick().await.unwrap();
        assert_eq!(unchanged.applied, 0);
        assert_eq!(
            accounts.get_by_id("id-murzik").await.unwrap().unwrap().traffic_used,
            500_000
        );
    }

    #[tokio::test]
    async fn unowned_ports_are_reported_not_charged() {
        let (mut svc, _accounts) = service_with(vec![
            counters(&[(9999, 1_000)]),
            counters(&[(9999, 2_000)]),
        ])
        .await;

        svc.tick().await.unwrap();
        let report = svc.tick().await.unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.unowned_ports, 1);
    }

    #[tokio::test]
    async fn unavailable_source_is_an_error() {
        let (mut svc, _accounts) = service_with(vec![]).await;
        let err = svc.tick().await.unwrap_err();
        assert!(matches!(err, PanelError::CounterSourceUnavailable(_)));
    }
}
