use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dokhae_common::HealthStatus;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::Instant;

use crate::breaker::{BreakerRegistry, BreakerStatus};
use crate::config::HealthConfig;
use crate::sampler::{MetricHistory, MetricSummary, SystemMetric, SystemProbe, SystemSnapshot};

/// A named liveness check run by `run_health_checks`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(())` when healthy; the error text ends up in the report.
    async fn check(&self) -> anyhow::Result<()>;
}

/// Free share of the filesystem holding `path`, picked by the longest
/// matching mount point. Entries are `(mount point, available, total)`.
pub fn free_disk_percent<'a>(mounts: impl IntoIterator<Item = (&'a Path, u64, u64)>, path: &Path) -> Option<f64> {
    mounts
        .into_iter()
        .filter(|(mount, _, total)| *total > 0 && path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.as_os_str().len())
        .map(|(_, available, total)| available as f64 / total as f64 * 100.0)
}

/// Fails when the filesystem holding `path` has too little free space.
pub struct DiskSpaceProbe {
    path: PathBuf,
    min_free_pct: f64,
}

impl DiskSpaceProbe {
    pub fn new(path: impl Into<PathBuf>, min_free_pct: f64) -> Self {
        Self {
            path: path.into(),
            min_free_pct,
        }
    }
}

#[async_trait]
impl HealthProbe for DiskSpaceProbe {
    fn name(&self) -> &str {
        "disk_space"
    }

    async fn check(&self) -> anyhow::Result<()> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mounts = disks
            .list()
            .iter()
            .map(|d| (d.mount_point(), d.available_space(), d.total_space()));
        let Some(free_pct) = free_disk_percent(mounts, &self.path) else {
            anyhow::bail!("no filesystem found for {}", self.path.display());
        };
        if free_pct <= self.min_free_pct {
            anyhow::bail!(
                "{:.1}% free on {}, need more than {:.1}%",
                free_pct,
                self.path.display(),
                self.min_free_pct
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub service: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub system: Option<SystemSnapshot>,
    pub error_rate: f64,
    pub checks: Vec<CheckResult>,
    pub breakers: Vec<BreakerStatus>,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Last `error_history` records for reports, plus one timestamp per error
/// inside the rate window so the rate never saturates at the history size.
struct ErrorLog {
    records: VecDeque<ErrorRecord>,
    window: VecDeque<Instant>,
}

impl ErrorLog {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&at) = self.window.front() {
            if now.duration_since(at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-dependency circuit breakers, process metrics and health checks.
pub struct HealthSupervisor {
    config: HealthConfig,
    started: Instant,
    breakers: BreakerRegistry,
    history: MetricHistory,
    system: Arc<dyn SystemProbe>,
    probes: RwLock<Vec<Arc<dyn HealthProbe>>>,
    errors: Mutex<ErrorLog>,
    samples_taken: AtomicU64,
}

impl HealthSupervisor {
    pub fn new(config: HealthConfig, system: Arc<dyn SystemProbe>) -> Self {
        Self {
            breakers: BreakerRegistry::new(config.breaker),
            history: MetricHistory::new(config.history_capacity),
            errors: Mutex::new(ErrorLog {
                records: VecDeque::with_capacity(config.error_history),
                window: VecDeque::new(),
            }),
            started: Instant::now(),
            system,
            probes: RwLock::new(Vec::new()),
            samples_taken: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn history(&self) -> &MetricHistory {
        &self.history
    }

    pub fn check(&self, dependency: &str) -> bool {
        self.breakers.check(dependency)
    }

    pub fn record_success(&self, dependency: &str) {
        self.breakers.record_success(dependency);
    }

    pub fn record_failure(&self, dependency: &str) {
        self.breakers.record_failure(dependency);
    }

    pub fn register_probe(&self, probe: Arc<dyn HealthProbe>) {
        tracing::debug!(check = probe.name(), "health check registered");
        self.probes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(probe);
    }

    pub fn record_error(&self, component: &str, correlation_id: Option<&str>, message: impl Into<String>) {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            component: component.to_string(),
            correlation_id: correlation_id.map(str::to_string),
            message: message.into(),
        };
        let now = Instant::now();
        let window = self.rate_window();
        let mut errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        errors.records.push_back(record);
        while errors.records.len() > self.config.error_history.max(1) {
            errors.records.pop_front();
        }
        errors.window.push_back(now);
        errors.prune(now, window);
    }

    fn rate_window(&self) -> Duration {
        Duration::from_secs(self.config.error_rate_window_secs.max(1))
    }

    /// Errors per second over the trailing window.
    pub fn error_rate(&self) -> f64 {
        let window = self.rate_window();
        let mut errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        errors.prune(Instant::now(), window);
        errors.window.len() as f64 / window.as_secs_f64()
    }

    pub fn recent_errors(&self, n: usize) -> Vec<ErrorRecord> {
        let errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        let skip = errors.records.len().saturating_sub(n);
        errors.records.iter().skip(skip).cloned().collect()
    }

    pub fn record_metric(&self, metric: SystemMetric, value: f64) {
        self.history.record(metric, value);
    }

    /// Takes one system sample and appends it to the metric history.
    pub fn collect_metrics(&self) -> SystemSnapshot {
        let snapshot = self.system.sample();
        self.history.record(SystemMetric::CpuPercent, snapshot.cpu_percent);
        self.history
            .record(SystemMetric::ResidentMemoryMb, snapshot.resident_memory_mb);
        self.history
            .record(SystemMetric::MemoryPercent, snapshot.memory_percent);
        self.history
            .record(SystemMetric::ThreadCount, snapshot.thread_count as f64);
        self.history.record(SystemMetric::ErrorRate, self.error_rate());

        if snapshot.memory_percent > self.config.critical_memory_pct {
            tracing::error!(
                memory_percent = snapshot.memory_percent,
                resident_memory_mb = snapshot.resident_memory_mb,
                "memory usage critical"
            );
        }

        let taken = self.samples_taken.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.summary_every > 0 && taken % self.config.summary_every == 0 {
            self.log_summary();
        }
        snapshot
    }

    fn log_summary(&self) {
        let p95 = |m| self.history.percentile(m, 95.0).unwrap_or(0.0);
        tracing::info!(
            cpu_p95 = p95(SystemMetric::CpuPercent),
            memory_mb_p95 = p95(SystemMetric::ResidentMemoryMb),
            queue_depth_p95 = p95(SystemMetric::QueueDepth),
            error_rate = self.error_rate(),
            "metrics summary"
        );
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples_taken.load(Ordering::Relaxed)
    }

    pub fn metric_summaries(&self) -> Vec<(SystemMetric, MetricSummary)> {
        SystemMetric::ALL
            .iter()
            .filter_map(|&m| self.history.summary(m).map(|s| (m, s)))
            .collect()
    }

    /// Runs every registered probe concurrently, each under the check timeout.
    pub async fn run_health_checks(&self) -> Vec<CheckResult> {
        let probes: Vec<Arc<dyn HealthProbe>> = self
            .probes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let timeout = self.config.check_timeout();

        join_all(probes.into_iter().map(|probe| async move {
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, probe.check()).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some(format!("timed out after {}ms", timeout.as_millis())),
            };
            if let Some(error) = &error {
                tracing::warn!(check = probe.name(), error = %error, "health check failed");
            }
            CheckResult {
                name: probe.name().to_string(),
                passed: error.is_none(),
                duration_ms,
                error,
            }
        }))
        .await
    }

    /// Fraction of failing checks, overridden by hard resource thresholds.
    pub fn aggregate_status(&self, checks: &[CheckResult], system: Option<&SystemSnapshot>) -> HealthStatus {
        let failed = checks.iter().filter(|c| !c.passed).count();
        let mut status = if failed == 0 {
            HealthStatus::Healthy
        } else if failed * 2 <= checks.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        if let Some(system) = system {
            if system.memory_percent > self.config.critical_memory_pct {
                status = HealthStatus::Critical;
            } else if system.cpu_percent > self.config.high_cpu_pct && status == HealthStatus::Healthy {
                status = HealthStatus::Degraded;
            }
        }
        status
    }

    fn latest_system(&self) -> Option<SystemSnapshot> {
        let cpu = self.history.latest(SystemMetric::CpuPercent)?;
        let rss = self.history.latest(SystemMetric::ResidentMemoryMb)?;
        let mem = self.history.latest(SystemMetric::MemoryPercent)?;
        let threads = self.history.latest(SystemMetric::ThreadCount)?;
        Some(SystemSnapshot {
            cpu_percent: cpu.value,
            resident_memory_mb: rss.value,
            memory_percent: mem.value,
            thread_count: threads.value as usize,
        })
    }

    pub async fn health_report(&self) -> HealthReport {
        let checks = self.run_health_checks().await;
        let system = self.latest_system().or_else(|| Some(self.system.sample()));
        let status = self.aggregate_status(&checks, system.as_ref());
        HealthReport {
            service: self.config.service_name.clone(),
            status,
            timestamp: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            system,
            error_rate: self.error_rate(),
            checks,
            breakers: self.breakers.statuses(),
            recent_errors: self.recent_errors(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dokhae_common::CircuitState;

    struct FixedSystem(SystemSnapshot);

    impl SystemProbe for FixedSystem {
        fn sample(&self) -> SystemSnapshot {
            self.0
        }
    }

    struct StaticProbe {
        name: &'static str,
        pass: bool,
    }

    #[async_trait]
    impl HealthProbe for StaticProbe {
        fn name(&self) -> &str {
            self.name
        }

        async fn check(&self) -> anyhow::Result<()> {
            if self.pass {
                Ok(())
            } else {
                anyhow::bail!("{} is down", self.name)
            }
        }
    }

    struct SlowProbe;

    #[async_trait]
    impl HealthProbe for SlowProbe {
        fn name(&self) -> &str {
            "slow"
        }

        async fn check(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    fn snapshot(cpu: f64, mem: f64) -> SystemSnapshot {
        SystemSnapshot {
            cpu_percent: cpu,
            resident_memory_mb: 50.0,
            memory_percent: mem,
            thread_count: 4,
        }
    }

    fn supervisor(system: SystemSnapshot) -> HealthSupervisor {
        HealthSupervisor::new(HealthConfig::default(), Arc::new(FixedSystem(system)))
    }

    fn probe(name: &'static str, pass: bool) -> Arc<dyn HealthProbe> {
        Arc::new(StaticProbe { name, pass })
    }

    #[tokio::test]
    async fn test_status_from_failing_fraction() {
        let hs = supervisor(snapshot(10.0, 10.0));
        for (name, pass) in [("a", true), ("b", true), ("c", false), ("d", true)] {
            hs.register_probe(probe(name, pass));
        }
        let report = hs.health_report().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.checks.len(), 4);
        let failed: Vec<&CheckResult> = report.checks.iter().filter(|c| !c.passed).collect();
        assert_eq!(failed[0].name, "c");
        assert_eq!(failed[0].error.as_deref(), Some("c is down"));

        hs.register_probe(probe("e", false));
        hs.register_probe(probe("f", false));
        // 3 of 6 failing is still at most half
        assert_eq!(hs.health_report().await.status, HealthStatus::Degraded);
        hs.register_probe(probe("g", false));
        assert_eq!(hs.health_report().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_memory_threshold_is_critical() {
        let hs = supervisor(snapshot(10.0, 95.0));
        hs.register_probe(probe("a", true));
        let report = hs.health_report().await;
        assert_eq!(report.status, HealthStatus::Critical);
        assert!(!report.status.is_serving());
    }

    #[tokio::test]
    async fn test_high_cpu_degrades_healthy() {
        let hs = supervisor(snapshot(97.0, 10.0));
        assert_eq!(hs.health_report().await.status, HealthStatus::Degraded);
        let checks = vec![CheckResult {
            name: "x".into(),
            passed: false,
            duration_ms: 1,
            error: None,
        }];
        // cpu never upgrades a worse status
        assert_eq!(
            hs.aggregate_status(&checks, Some(&snapshot(97.0, 10.0))),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_timeout_counts_as_failure() {
        let hs = supervisor(snapshot(10.0, 10.0));
        hs.register_probe(Arc::new(SlowProbe));
        let results = hs.run_health_checks().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
        assert_eq!(results[0].duration_ms, 2000);
        assert_eq!(results[0].error.as_deref(), Some("timed out after 2000ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rate_trailing_window() {
        let hs = supervisor(snapshot(10.0, 10.0));
        for i in 0..6 {
            hs.record_error("primary", Some("c1"), format!("boom {i}"));
        }
        assert!((hs.error_rate() - 0.1).abs() < 1e-9);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(hs.error_rate(), 0.0);
        let recent = hs.recent_errors(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[4].message, "boom 5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rate_counts_past_history_size() {
        let hs = supervisor(snapshot(10.0, 10.0));
        for i in 0..600 {
            hs.record_error("primary", None, format!("e{i}"));
        }
        assert!((hs.error_rate() - 10.0).abs() < 1e-9);
        assert_eq!(hs.recent_errors(1000).len(), 100);

        tokio::time::advance(Duration::from_secs(30)).await;
        for i in 0..60 {
            hs.record_error("primary", None, format!("late{i}"));
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        // only the second burst is still inside the window
        assert!((hs.error_rate() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_history_is_bounded() {
        let hs = supervisor(snapshot(10.0, 10.0));
        for i in 0..150 {
            hs.record_error("secondary", None, format!("e{i}"));
        }
        let all = hs.recent_errors(1000);
        assert_eq!(all.len(), 100);
        assert_eq!(all[0].message, "e50");
    }

    #[test]
    fn test_free_disk_percent_uses_longest_mount() {
        let mounts = [
            (Path::new("/"), 50u64, 100u64),
            (Path::new("/data"), 5, 100),
            (Path::new("/empty"), 0, 0),
        ];
        assert_eq!(free_disk_percent(mounts, Path::new("/data/corpus")), Some(5.0));
        assert_eq!(free_disk_percent(mounts, Path::new("/var/log")), Some(50.0));
        // "/database" is not under "/data"
        assert_eq!(free_disk_percent(mounts, Path::new("/database")), Some(50.0));
        assert_eq!(free_disk_percent(mounts, Path::new("/empty/x")), Some(50.0));
        assert_eq!(free_disk_percent(mounts[1..].iter().copied(), Path::new("/srv")), None);
    }

    #[tokio::test]
    async fn test_disk_probe_thresholds() {
        assert!(DiskSpaceProbe::new("/", 100.0).check().await.is_err());
        // a filesystem can always report more than -1% free, if sysinfo finds one
        let result = DiskSpaceProbe::new("/", -1.0).check().await;
        if let Err(err) = result {
            assert!(err.to_string().starts_with("no filesystem found"));
        }
    }

    #[test]
    fn test_collect_metrics_fills_history() {
        let hs = supervisor(snapshot(12.0, 30.0));
        for _ in 0..3 {
            hs.collect_metrics();
        }
        assert_eq!(hs.samples_taken(), 3);
        assert_eq!(hs.history().len(SystemMetric::CpuPercent), 3);
        assert_eq!(hs.history().len(SystemMetric::ThreadCount), 3);
        let summaries = hs.metric_summaries();
        assert!(summaries.iter().any(|(m, s)| *m == SystemMetric::MemoryPercent && s.latest == 30.0));
    }

    #[tokio::test]
    async fn test_report_includes_breakers() {
        let hs = supervisor(snapshot(10.0, 10.0));
        for _ in 0..5 {
            hs.record_failure("primary");
        }
        assert!(!hs.check("primary"));
        let report = hs.health_report().await;
        assert_eq!(report.breakers.len(), 1);
        assert_eq!(report.breakers[0].state, CircuitState::Open);
        assert_eq!(report.status, HealthStatus::Healthy);
    }
}
