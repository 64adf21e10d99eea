use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::{BudgetAllocation, StageBudget};
use crate::error::GovernanceError;

#[derive(Debug, Default)]
struct TrackerState {
    stage_timings: Vec<(String, Duration)>,
    current_stage: Option<String>,
}

/// Shrinking deadline for one request.
///
/// `remaining()` is wall clock since creation, so time spent queued before the
/// first stage counts against the budget too.
#[derive(Debug)]
pub struct BudgetTracker {
    correlation_id: String,
    allocation: BudgetAllocation,
    started: Instant,
    state: Mutex<TrackerState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSummary {
    pub correlation_id: String,
    pub total_ms: u64,
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
    pub stages: Vec<StageTiming>,
}

impl BudgetTracker {
    fn new(correlation_id: String, allocation: BudgetAllocation) -> Self {
        Self {
            correlation_id,
            allocation,
            started: Instant::now(),
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn total(&self) -> Duration {
        self.allocation.total()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.total().saturating_sub(self.elapsed())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn stage_allocation(&self, stage: &str) -> Duration {
        self.allocation.stage_allocation(stage)
    }

    pub fn allocation(&self) -> &BudgetAllocation {
        &self.allocation
    }

    pub fn current_stage(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current_stage
            .clone()
    }

    /// Elapsed time of every completed stage, in execution order.
    pub fn stage_timings(&self) -> Vec<(String, Duration)> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stage_timings
            .clone()
    }

    fn begin_stage(&self, stage: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.current_stage = Some(stage.to_string());
    }

    fn finish_stage(&self, stage: &str, elapsed: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stage_timings.push((stage.to_string(), elapsed));
        state.current_stage = None;
    }

    pub fn summary(&self) -> BudgetSummary {
        BudgetSummary {
            correlation_id: self.correlation_id.clone(),
            total_ms: self.allocation.total_ms,
            elapsed_ms: self.elapsed().as_millis() as u64,
            remaining_ms: self.remaining().as_millis() as u64,
            stages: self
                .stage_timings()
                .into_iter()
                .map(|(stage, elapsed)| StageTiming {
                    stage,
                    elapsed_ms: elapsed.as_millis() as u64,
                })
                .collect(),
        }
    }
}

/// Removes its tracker from the manager when dropped.
pub struct TrackerGuard {
    tracker: Arc<BudgetTracker>,
    trackers: Arc<DashMap<String, Arc<BudgetTracker>>>,
}

impl TrackerGuard {
    pub fn tracker(&self) -> &Arc<BudgetTracker> {
        &self.tracker
    }
}

impl Deref for TrackerGuard {
    type Target = BudgetTracker;

    fn deref(&self) -> &BudgetTracker {
        &self.tracker
    }
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        // A newer tracker under the same id is left alone.
        self.trackers
            .remove_if(&self.tracker.correlation_id, |_, t| Arc::ptr_eq(t, &self.tracker));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetMetrics {
    pub active_trackers: usize,
    pub avg_remaining_ms: f64,
    pub trackers_created: u64,
    pub budget_exhausted: u64,
    pub stage_timeouts: u64,
    pub total_budget_ms: u64,
    pub stage_allocations: Vec<StageBudget>,
}

pub struct TimeoutBudgetManager {
    default_allocation: BudgetAllocation,
    trackers: Arc<DashMap<String, Arc<BudgetTracker>>>,
    trackers_created: AtomicU64,
    budget_exhausted: AtomicU64,
    stage_timeouts: AtomicU64,
}

impl TimeoutBudgetManager {
    pub fn new(default_allocation: BudgetAllocation) -> Self {
        Self {
            default_allocation,
            trackers: Arc::new(DashMap::new()),
            trackers_created: AtomicU64::new(0),
            budget_exhausted: AtomicU64::new(0),
            stage_timeouts: AtomicU64::new(0),
        }
    }

    pub fn default_allocation(&self) -> &BudgetAllocation {
        &self.default_allocation
    }

    /// Starts the clock for `correlation_id`. An existing tracker under the
    /// same id is replaced.
    pub fn create_tracker(&self, correlation_id: &str, allocation: BudgetAllocation) -> Arc<BudgetTracker> {
        let tracker = Arc::new(BudgetTracker::new(correlation_id.to_string(), allocation));
        if self
            .trackers
            .insert(correlation_id.to_string(), tracker.clone())
            .is_some()
        {
            tracing::warn!(correlation_id, "budget tracker replaced");
        }
        self.trackers_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            correlation_id,
            total_ms = tracker.allocation.total_ms,
            "budget tracker created"
        );
        tracker
    }

    /// Creates a tracker with the default allocation, removed again when the
    /// guard drops.
    pub fn track(&self, correlation_id: &str) -> TrackerGuard {
        let tracker = self.create_tracker(correlation_id, self.default_allocation.clone());
        TrackerGuard {
            tracker,
            trackers: self.trackers.clone(),
        }
    }

    pub fn get_tracker(&self, correlation_id: &str) -> Option<Arc<BudgetTracker>> {
        self.trackers.get(correlation_id).map(|t| t.clone())
    }

    pub fn cleanup_tracker(&self, correlation_id: &str) -> Option<BudgetSummary> {
        let (_, tracker) = self.trackers.remove(correlation_id)?;
        let summary = tracker.summary();
        tracing::debug!(
            correlation_id,
            elapsed_ms = summary.elapsed_ms,
            stages = summary.stages.len(),
            "budget tracker cleaned up"
        );
        Some(summary)
    }

    pub fn active_trackers(&self) -> usize {
        self.trackers.len()
    }

    /// Runs `fut` as stage `stage` of `tracker`'s request.
    ///
    /// Refuses to start once the budget is spent. Otherwise the stage gets
    /// `min(stage allocation, remaining)`; running past that drops the future
    /// and yields `StageTimeout`.
    pub async fn run_stage<T, Fut>(&self, tracker: &BudgetTracker, stage: &str, fut: Fut) -> Result<T, GovernanceError>
    where
        Fut: Future<Output = T>,
    {
        let remaining = tracker.remaining();
        if remaining.is_zero() {
            self.budget_exhausted.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                correlation_id = %tracker.correlation_id,
                stage,
                "timeout budget exhausted"
            );
            return Err(GovernanceError::BudgetExhausted {
                correlation_id: tracker.correlation_id.clone(),
            });
        }

        let deadline = tracker.stage_allocation(stage).min(remaining);
        tracker.begin_stage(stage);
        tracing::debug!(
            correlation_id = %tracker.correlation_id,
            stage,
            deadline_ms = deadline.as_millis() as u64,
            remaining_ms = remaining.as_millis() as u64,
            "stage started"
        );

        let started = Instant::now();
        match tokio::time::timeout(deadline, fut).await {
            Ok(value) => {
                let elapsed = started.elapsed();
                tracker.finish_stage(stage, elapsed);
                tracing::debug!(
                    correlation_id = %tracker.correlation_id,
                    stage,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "stage finished"
                );
                Ok(value)
            }
            Err(_) => {
                tracker.finish_stage(stage, started.elapsed());
                self.stage_timeouts.fetch_add(1, Ordering::Relaxed);
                let deadline_ms = deadline.as_millis() as u64;
                tracing::warn!(
                    correlation_id = %tracker.correlation_id,
                    stage,
                    deadline_ms,
                    "stage timed out"
                );
                Err(GovernanceError::StageTimeout {
                    stage: stage.to_string(),
                    deadline_ms,
                })
            }
        }
    }

    pub fn metrics(&self) -> BudgetMetrics {
        let remaining: Vec<f64> = self
            .trackers
            .iter()
            .map(|t| t.remaining().as_millis() as f64)
            .collect();
        BudgetMetrics {
            active_trackers: remaining.len(),
            avg_remaining_ms: if remaining.is_empty() {
                0.0
            } else {
                remaining.iter().sum::<f64>() / remaining.len() as f64
            },
            trackers_created: self.trackers_created.load(Ordering::Relaxed),
            budget_exhausted: self.budget_exhausted.load(Ordering::Relaxed),
            stage_timeouts: self.stage_timeouts.load(Ordering::Relaxed),
            total_budget_ms: self.default_allocation.total_ms,
            stage_allocations: self.default_allocation.stages.clone(),
        }
    }
}
