use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GovernanceError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub admission: AdmissionConfig,
    pub budget: BudgetAllocation,
    pub memory: MemoryConfig,
    pub health: HealthConfig,
}

impl GovernanceConfig {
    pub fn validate(&self) -> Result<(), GovernanceError> {
        let invalid = |msg: &str| Err(GovernanceError::InvalidConfig(msg.to_string()));

        if self.admission.global_limit == 0 {
            return invalid("admission.global_limit must be > 0");
        }
        if self.admission.session_limit == 0 {
            return invalid("admission.session_limit must be > 0");
        }
        if self.admission.retry_window == 0 {
            return invalid("admission.retry_window must be > 0");
        }
        if self.budget.total_ms == 0 {
            return invalid("budget.total_ms must be > 0");
        }
        if self.budget.stages.is_empty() {
            return invalid("budget.stages must name at least one stage");
        }
        if let Some(stage) = self.budget.stages.iter().find(|s| s.budget_ms == 0) {
            return Err(GovernanceError::InvalidConfig(format!(
                "budget stage '{}' has a zero allocation",
                stage.name
            )));
        }
        if self.memory.memory_limit_mb == 0 {
            return invalid("memory.memory_limit_mb must be > 0");
        }
        if self.memory.split_threshold == 0 {
            return invalid("memory.split_threshold must be > 0");
        }
        if self.memory.max_segments == 0 {
            return invalid("memory.max_segments must be > 0");
        }
        if self.health.history_capacity == 0 {
            return invalid("health.history_capacity must be > 0");
        }
        if self.health.sample_interval_ms == 0 {
            return invalid("health.sample_interval_ms must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub global_limit: usize,
    pub session_limit: usize,
    /// Bound on each of the two semaphore waits in `acquire`.
    pub acquire_timeout_ms: u64,
    /// Number of recent request durations kept for the retry hint.
    pub retry_window: usize,
    /// Number of occupancy samples kept for the queue-depth p95.
    pub queue_depth_window: usize,
    /// Sessions with no holders for this long are dropped.
    pub session_idle_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_limit: 200,
            session_limit: 100,
            acquire_timeout_ms: 1000,
            retry_window: 20,
            queue_depth_window: 100,
            session_idle_secs: 1800,
        }
    }
}

impl AdmissionConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

/// One named stage and its independent time cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBudget {
    pub name: String,
    pub budget_ms: u64,
}

impl StageBudget {
    pub fn new(name: impl Into<String>, budget_ms: u64) -> Self {
        Self {
            name: name.into(),
            budget_ms,
        }
    }
}

/// Ordered stage allocation table.
///
/// Stage caps are independent ceilings; they do not have to sum to `total_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetAllocation {
    pub total_ms: u64,
    pub stages: Vec<StageBudget>,
    /// Cap for a stage missing from `stages`.
    pub default_stage_ms: u64,
}

impl Default for BudgetAllocation {
    fn default() -> Self {
        Self {
            total_ms: 5000,
            stages: vec![
                StageBudget::new("primary", 2500),
                StageBudget::new("secondary", 1500),
                StageBudget::new("tertiary", 1000),
            ],
            default_stage_ms: 1000,
        }
    }
}

impl BudgetAllocation {
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms)
    }

    pub fn stage_allocation(&self, stage: &str) -> Duration {
        let ms = self
            .stages
            .iter()
            .find(|s| s.name == stage)
            .map(|s| s.budget_ms)
            .unwrap_or(self.default_stage_ms);
        Duration::from_millis(ms)
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub memory_limit_mb: u64,
    /// Cost units above which input is split into segments.
    pub split_threshold: usize,
    pub max_segments: usize,
    /// Distance (in chars) around a split point scanned for discourse markers.
    pub marker_window_chars: usize,
    /// Fraction of the ceiling at which a warning is logged.
    pub warn_ratio: f64,
    /// Name of the cost estimator, see `estimator::parse_estimator`.
    pub estimator: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 100,
            split_threshold: 2000,
            max_segments: 100,
            marker_window_chars: 100,
            warn_ratio: 0.8,
            estimator: "hangul_weighted".to_string(),
        }
    }
}

impl MemoryConfig {
    pub fn limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub service_name: String,
    pub sample_interval_ms: u64,
    /// Samples kept per metric (300 = five minutes at 1s).
    pub history_capacity: usize,
    pub error_history: usize,
    /// Trailing window for the error rate.
    pub error_rate_window_secs: u64,
    pub check_timeout_ms: u64,
    pub critical_memory_pct: f64,
    pub high_cpu_pct: f64,
    /// Filesystem watched by the disk-space check.
    pub disk_path: String,
    /// The disk-space check fails below this free share; 0 disables it.
    pub min_free_disk_pct: f64,
    /// Log a metrics summary every this many samples.
    pub summary_every: u64,
    pub breaker: BreakerConfig,
    /// Breaker settings for analyzer stages.
    pub analyzer_breaker: BreakerConfig,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            service_name: "dokhae-governor".to_string(),
            sample_interval_ms: 1000,
            history_capacity: 300,
            error_history: 100,
            error_rate_window_secs: 60,
            check_timeout_ms: 2000,
            critical_memory_pct: 90.0,
            high_cpu_pct: 90.0,
            disk_path: "/".to_string(),
            min_free_disk_pct: 10.0,
            summary_every: 60,
            breaker: BreakerConfig::default(),
            analyzer_breaker: BreakerConfig {
                failure_threshold: 3,
                recovery_timeout_ms: 60_000,
            },
        }
    }
}

impl HealthConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}
