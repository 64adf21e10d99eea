use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dokhae_common::RequestContext;
use serde::Serialize;

use crate::config::MemoryConfig;
use crate::error::GovernanceError;
use crate::estimator::{parse_estimator, CostEstimator};
use crate::splitter::{SentenceRules, SentenceSplitter, TextSegment};

const MB: f64 = 1024.0 * 1024.0;

/// Source of the process memory reading the governor enforces against.
pub trait MemoryProbe: Send + Sync {
    /// Resident bytes, or `None` when the platform cannot tell.
    fn current_bytes(&self) -> Option<u64>;

    /// Best-effort attempt to give memory back (cache purges etc).
    fn reclaim(&self);
}

pub type ReclaimHook = Box<dyn Fn() + Send + Sync>;

/// Reads resident set size from `/proc/self/status`, falling back to sysinfo.
pub struct ProcessMemoryProbe {
    system: Mutex<sysinfo::System>,
    hooks: Mutex<Vec<(String, ReclaimHook)>>,
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
            hooks: Mutex::new(Vec::new()),
        }
    }
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback run on every `reclaim()`.
    pub fn register_hook(&self, name: impl Into<String>, hook: ReclaimHook) {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), hook));
    }

    fn sysinfo_rss(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| p.memory())
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn current_bytes(&self) -> Option<u64> {
        proc_status_rss().or_else(|| self.sysinfo_rss())
    }

    fn reclaim(&self) {
        let hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        for (name, hook) in hooks.iter() {
            tracing::debug!(hook = %name, "running reclaim hook");
            hook();
        }
        tracing::info!(hooks = hooks.len(), "memory reclaim pass finished");
    }
}

fn proc_status_rss() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_status_kb(&status, "VmRSS:").map(|kb| kb.saturating_mul(1024))
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Value of a `Key:   1234 kB` line in a `/proc/<pid>/status` dump.
pub(crate) fn parse_status_kb(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.trim_start().strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

/// One processed segment.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentOutcome<T> {
    pub segment_id: usize,
    pub context: String,
    pub value: T,
}

/// A segment that was left out of the result, and why.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedSegment {
    pub segment_id: usize,
    pub context: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentRun<T> {
    pub outcomes: Vec<SegmentOutcome<T>>,
    pub skipped: Vec<SkippedSegment>,
}

impl<T> SegmentRun<T> {
    pub fn is_degraded(&self) -> bool {
        !self.skipped.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryMetrics {
    pub limit_mb: u64,
    pub current_mb: f64,
    pub peak_mb: f64,
    pub utilization_pct: f64,
    pub split_threshold: usize,
    pub estimator: &'static str,
    pub reclaims: u64,
    pub skipped_segments: u64,
}

/// Decides whether and how to partition input, and keeps segment processing
/// under the memory ceiling.
pub struct MemoryGovernor {
    config: MemoryConfig,
    estimator: Box<dyn CostEstimator>,
    splitter: SentenceSplitter,
    probe: Arc<dyn MemoryProbe>,
    peak_bytes: AtomicU64,
    last_bytes: AtomicU64,
    reclaims: AtomicU64,
    skipped_segments: AtomicU64,
}

impl MemoryGovernor {
    pub fn new(config: MemoryConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self, GovernanceError> {
        let estimator = parse_estimator(&config.estimator).map_err(GovernanceError::InvalidConfig)?;
        let rules = SentenceRules::korean().map_err(|e| GovernanceError::InvalidConfig(e.to_string()))?;
        let splitter = SentenceSplitter::new(rules, config.max_segments, config.marker_window_chars);
        Ok(Self {
            config,
            estimator,
            splitter,
            probe,
            peak_bytes: AtomicU64::new(0),
            last_bytes: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
            skipped_segments: AtomicU64::new(0),
        })
    }

    pub fn estimate_cost(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    pub fn split_threshold(&self) -> usize {
        self.config.split_threshold
    }

    /// `prepare` at the configured threshold, reusing the context's memoised cost.
    pub fn prepare_context(&self, ctx: &RequestContext) -> Result<Vec<TextSegment>, GovernanceError> {
        let cost = ctx.cost_estimate_with(|t| self.estimate_cost(t));
        self.prepare_inner(&ctx.text, cost, self.config.split_threshold)
    }

    pub fn prepare(&self, text: &str, threshold: usize) -> Result<Vec<TextSegment>, GovernanceError> {
        self.prepare_inner(text, self.estimate_cost(text), threshold)
    }

    fn prepare_inner(&self, text: &str, cost: usize, threshold: usize) -> Result<Vec<TextSegment>, GovernanceError> {
        if text.trim().is_empty() {
            return Err(GovernanceError::EmptyInput);
        }
        let threshold = threshold.max(1);

        if cost <= threshold {
            return Ok(vec![TextSegment {
                id: 0,
                start: 0,
                end: text.len(),
                text: text.to_string(),
                cost,
                is_sentence_boundary: true,
                context: "no_split_needed".to_string(),
            }]);
        }

        let segments = self.splitter.split(text, threshold, self.estimator.as_ref());
        let max_cost = threshold.saturating_mul(2);
        for seg in &segments {
            if seg.cost == 0 || seg.cost > max_cost || seg.text.trim().is_empty() {
                tracing::warn!(
                    segment_id = seg.id,
                    cost = seg.cost,
                    max_cost,
                    context = %seg.context,
                    "segment violates cost bound"
                );
                return Err(GovernanceError::TextTooLarge {
                    cost: seg.cost,
                    max_cost,
                });
            }
        }
        if segments.is_empty() {
            return Err(GovernanceError::EmptyInput);
        }

        tracing::debug!(cost, threshold, segments = segments.len(), "input split");
        Ok(segments)
    }

    /// Current resident bytes against the ceiling.
    ///
    /// An unreadable probe counts as zero usage.
    pub fn check_memory(&self, context: &str) -> Result<u64, GovernanceError> {
        let Some(current) = self.probe.current_bytes() else {
            return Ok(0);
        };
        self.last_bytes.store(current, Ordering::Relaxed);
        self.peak_bytes.fetch_max(current, Ordering::Relaxed);

        let limit = self.config.limit_bytes();
        if current > limit {
            return Err(GovernanceError::MemoryLimitExceeded {
                current_mb: current as f64 / MB,
                limit_mb: self.config.memory_limit_mb,
                context: context.to_string(),
            });
        }
        if (current as f64) >= limit as f64 * self.config.warn_ratio {
            tracing::warn!(
                current_mb = current as f64 / MB,
                limit_mb = self.config.memory_limit_mb,
                context,
                "memory usage approaching limit"
            );
        }
        Ok(current)
    }

    /// Runs `f` over each segment in order under the memory ceiling.
    ///
    /// Over the ceiling, one reclaim pass runs and the check repeats; a segment
    /// that still does not fit is skipped. Non-fatal errors from `f` also skip
    /// the segment; fatal ones abort the run.
    pub async fn process_with_memory_control<T, F, Fut>(
        &self,
        segments: Vec<TextSegment>,
        mut f: F,
    ) -> Result<SegmentRun<T>, GovernanceError>
    where
        F: FnMut(TextSegment) -> Fut,
        Fut: Future<Output = Result<T, GovernanceError>>,
    {
        let mut outcomes = Vec::with_capacity(segments.len());
        let mut skipped = Vec::new();

        for mut segment in segments {
            let label = format!("segment_{}", segment.id);
            if let Err(err) = self.check_memory(&label) {
                tracing::warn!(segment_id = segment.id, error = %err, "reclaiming before retry");
                self.probe.reclaim();
                self.reclaims.fetch_add(1, Ordering::Relaxed);

                if let Err(err) = self.check_memory(&label) {
                    tracing::error!(segment_id = segment.id, error = %err, "skipping segment, memory still over limit");
                    self.skipped_segments.fetch_add(1, Ordering::Relaxed);
                    skipped.push(SkippedSegment {
                        segment_id: segment.id,
                        context: segment.context,
                        reason: err.to_string(),
                    });
                    continue;
                }
                segment.context.push_str("_retry");
            }

            let segment_id = segment.id;
            let context = segment.context.clone();
            match f(segment).await {
                Ok(value) => outcomes.push(SegmentOutcome {
                    segment_id,
                    context,
                    value,
                }),
                Err(err) if err.is_fatal_for_request() => return Err(err),
                Err(err) => {
                    tracing::warn!(segment_id, error = %err, "segment failed, continuing degraded");
                    self.skipped_segments.fetch_add(1, Ordering::Relaxed);
                    skipped.push(SkippedSegment {
                        segment_id,
                        context,
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(SegmentRun { outcomes, skipped })
    }

    pub fn metrics(&self) -> MemoryMetrics {
        let current = self
            .probe
            .current_bytes()
            .unwrap_or_else(|| self.last_bytes.load(Ordering::Relaxed));
        self.peak_bytes.fetch_max(current, Ordering::Relaxed);
        let limit = self.config.limit_bytes().max(1);
        MemoryMetrics {
            limit_mb: self.config.memory_limit_mb,
            current_mb: current as f64 / MB,
            peak_mb: self.peak_bytes.load(Ordering::Relaxed) as f64 / MB,
            utilization_pct: current as f64 / limit as f64 * 100.0,
            split_threshold: self.config.split_threshold,
            estimator: self.estimator.name(),
            reclaims: self.reclaims.load(Ordering::Relaxed),
            skipped_segments: self.skipped_segments.load(Ordering::Relaxed),
        }
    }
}
