use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use dokhae_common::{AdmissionDecision, RequestContext};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::AdmissionConfig;
use crate::error::{GovernanceError, RejectReason};
use crate::sampler::percentile;

/// Retry hint when no request has completed yet.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;
const MIN_RETRY_AFTER_SECS: u64 = 1;
const MAX_RETRY_AFTER_SECS: u64 = 30;

struct SessionSlot {
    permits: Arc<Semaphore>,
    last_used_ms: AtomicU64,
}

/// Counters and rolling windows shared with outstanding permits.
struct AdmissionStats {
    epoch: Instant,
    retry_window: usize,
    durations: Mutex<VecDeque<Duration>>,
    total_requests: AtomicU64,
    admitted: AtomicU64,
    rejected_global: AtomicU64,
    rejected_session: AtomicU64,
    acquire_timeouts: AtomicU64,
    completed: AtomicU64,
    duration_sum_ms: AtomicU64,
}

impl AdmissionStats {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn record_duration(&self, duration: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.duration_sum_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        let mut window = self.durations.lock().unwrap_or_else(|e| e.into_inner());
        window.push_back(duration);
        while window.len() > self.retry_window {
            window.pop_front();
        }
    }

    fn p95_duration_secs(&self) -> Option<f64> {
        let window = self.durations.lock().unwrap_or_else(|e| e.into_inner());
        let secs: Vec<f64> = window.iter().map(Duration::as_secs_f64).collect();
        percentile(&secs, 95.0)
    }
}

/// `clamp(ceil(p95 * 1.5), 1, 30)`, or the default with no history.
pub fn retry_after_from_p95(p95_secs: Option<f64>) -> u64 {
    match p95_secs {
        Some(p95) => ((p95 * 1.5).ceil() as u64).clamp(MIN_RETRY_AFTER_SECS, MAX_RETRY_AFTER_SECS),
        None => DEFAULT_RETRY_AFTER_SECS,
    }
}

/// Structured rejection handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub reason: RejectReason,
    /// Which ceiling turned the request away; for `AcquireTimeout` this is
    /// the wait that ran out.
    pub decision: AdmissionDecision,
    pub retry_after_secs: u64,
}

impl From<Rejection> for GovernanceError {
    fn from(r: Rejection) -> Self {
        GovernanceError::AdmissionRejected {
            reason: r.reason,
            retry_after_secs: r.retry_after_secs,
        }
    }
}

/// Both slots of an admitted request.
///
/// Dropping the permit returns the slots; if `AdmissionController::release`
/// was not called, the time since admission is recorded as the duration.
pub struct AdmissionPermit {
    session_id: String,
    started: Instant,
    stats: Arc<AdmissionStats>,
    slot: Arc<SessionSlot>,
    recorded: bool,
    _session: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.recorded {
            self.stats.record_duration(self.started.elapsed());
        }
        self.slot
            .last_used_ms
            .store(self.stats.now_ms(), Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub enum Admission {
    Admitted(AdmissionPermit),
    Rejected(Rejection),
}

impl Admission {
    pub fn decision(&self) -> AdmissionDecision {
        match self {
            Admission::Admitted(_) => AdmissionDecision::Admit,
            Admission::Rejected(r) => r.decision,
        }
    }

    pub fn into_result(self) -> Result<AdmissionPermit, Rejection> {
        match self {
            Admission::Admitted(p) => Ok(p),
            Admission::Rejected(r) => Err(r),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionMetrics {
    pub total_requests: u64,
    pub admitted: u64,
    pub rejected_global: u64,
    pub rejected_session: u64,
    pub acquire_timeouts: u64,
    pub rejection_rate: f64,
    pub global_limit: usize,
    pub session_limit: usize,
    pub active_global: usize,
    pub session_count: usize,
    /// Sessions currently holding at least one slot.
    pub session_occupancy: BTreeMap<String, usize>,
    pub avg_duration_ms: f64,
    pub queue_depth_p95: f64,
    pub retry_after_secs: u64,
}

/// Dual-ceiling gatekeeper: one global slot pool plus one pool per session.
pub struct AdmissionController {
    config: AdmissionConfig,
    global: Arc<Semaphore>,
    sessions: DashMap<String, Arc<SessionSlot>>,
    queue_depth: Mutex<VecDeque<usize>>,
    stats: Arc<AdmissionStats>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        tracing::info!(
            global_limit = config.global_limit,
            session_limit = config.session_limit,
            "admission controller initialized"
        );
        Self {
            global: Arc::new(Semaphore::new(config.global_limit)),
            sessions: DashMap::new(),
            queue_depth: Mutex::new(VecDeque::with_capacity(config.queue_depth_window)),
            stats: Arc::new(AdmissionStats {
                epoch: Instant::now(),
                retry_window: config.retry_window.max(1),
                durations: Mutex::new(VecDeque::with_capacity(config.retry_window)),
                total_requests: AtomicU64::new(0),
                admitted: AtomicU64::new(0),
                rejected_global: AtomicU64::new(0),
                rejected_session: AtomicU64::new(0),
                acquire_timeouts: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                duration_sum_ms: AtomicU64::new(0),
            }),
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    fn session_slot(&self, session_id: &str) -> Arc<SessionSlot> {
        let now = self.stats.now_ms();
        let slot = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionSlot {
                    permits: Arc::new(Semaphore::new(self.config.session_limit)),
                    last_used_ms: AtomicU64::new(now),
                })
            });
        slot.last_used_ms.store(now, Ordering::Relaxed);
        slot.clone()
    }

    fn reject(&self, ctx: &RequestContext, reason: RejectReason, decision: AdmissionDecision) -> Admission {
        let counter = match reason {
            RejectReason::GlobalLimit => &self.stats.rejected_global,
            RejectReason::SessionLimit => &self.stats.rejected_session,
            RejectReason::AcquireTimeout => &self.stats.acquire_timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let retry_after_secs = self.retry_after_secs();
        tracing::warn!(
            session_id = %ctx.session_id,
            correlation_id = %ctx.correlation_id,
            reason = %reason,
            ceiling = decision.as_str(),
            retry_after_secs,
            "request rejected"
        );
        Admission::Rejected(Rejection {
            reason,
            decision,
            retry_after_secs,
        })
    }

    fn permit(
        &self,
        ctx: &RequestContext,
        slot: Arc<SessionSlot>,
        global: OwnedSemaphorePermit,
        session: OwnedSemaphorePermit,
    ) -> Admission {
        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            session_id = %ctx.session_id,
            correlation_id = %ctx.correlation_id,
            active_global = self.active_global(),
            "request admitted"
        );
        Admission::Admitted(AdmissionPermit {
            session_id: ctx.session_id.clone(),
            started: Instant::now(),
            stats: self.stats.clone(),
            slot,
            recorded: false,
            _session: session,
            _global: global,
        })
    }

    /// Non-blocking admission. Slots are taken atomically on success, so
    /// occupancy can never exceed either ceiling.
    pub fn try_admit(&self, ctx: &RequestContext) -> Admission {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let Ok(global) = self.global.clone().try_acquire_owned() else {
            return self.reject(ctx, RejectReason::GlobalLimit, AdmissionDecision::RejectGlobal);
        };
        let slot = self.session_slot(&ctx.session_id);
        let Ok(session) = slot.permits.clone().try_acquire_owned() else {
            drop(global);
            return self.reject(ctx, RejectReason::SessionLimit, AdmissionDecision::RejectSession);
        };
        self.permit(ctx, slot, global, session)
    }

    /// Waits up to `timeout` for the global slot, then up to `timeout` for the
    /// session slot. A failed session wait gives the global slot back.
    pub async fn acquire(&self, ctx: &RequestContext, timeout: Duration) -> Admission {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let global = match tokio::time::timeout(timeout, self.global.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return self.reject(ctx, RejectReason::AcquireTimeout, AdmissionDecision::RejectGlobal),
        };
        let slot = self.session_slot(&ctx.session_id);
        let session = match tokio::time::timeout(timeout, slot.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                drop(global);
                return self.reject(ctx, RejectReason::AcquireTimeout, AdmissionDecision::RejectSession);
            }
        };
        self.permit(ctx, slot, global, session)
    }

    /// Returns both slots and records `duration` for the retry hint.
    pub fn release(&self, mut permit: AdmissionPermit, duration: Duration) {
        permit.recorded = true;
        self.stats.record_duration(duration);
        drop(permit);
    }

    pub fn retry_after_secs(&self) -> u64 {
        retry_after_from_p95(self.stats.p95_duration_secs())
    }

    pub fn active_global(&self) -> usize {
        self.config
            .global_limit
            .saturating_sub(self.global.available_permits())
    }

    pub fn active_session(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|slot| {
                self.config
                    .session_limit
                    .saturating_sub(slot.permits.available_permits())
            })
            .unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Records current global occupancy into the queue-depth window.
    pub fn sample_queue_depth(&self) -> usize {
        let depth = self.active_global();
        let mut window = self.queue_depth.lock().unwrap_or_else(|e| e.into_inner());
        window.push_back(depth);
        while window.len() > self.config.queue_depth_window.max(1) {
            window.pop_front();
        }
        depth
    }

    pub fn queue_depth_p95(&self) -> f64 {
        let window = self.queue_depth.lock().unwrap_or_else(|e| e.into_inner());
        let values: Vec<f64> = window.iter().map(|&d| d as f64).collect();
        percentile(&values, 95.0).unwrap_or(0.0)
    }

    /// Drops sessions nobody holds or waits on and that have been idle for
    /// at least `idle`. Returns how many were removed.
    pub fn cleanup_idle_sessions(&self, idle: Duration) -> usize {
        let now = self.stats.now_ms();
        let idle_ms = idle.as_millis() as u64;
        let limit = self.config.session_limit;
        let before = self.sessions.len();
        self.sessions.retain(|_, slot| {
            let unused = Arc::strong_count(slot) == 1
                && Arc::strong_count(&slot.permits) == 1
                && slot.permits.available_permits() == limit;
            let idle_for = now.saturating_sub(slot.last_used_ms.load(Ordering::Relaxed));
            !(unused && idle_for >= idle_ms)
        });
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::info!(removed, remaining = self.sessions.len(), "idle sessions cleaned up");
        }
        removed
    }

    pub fn metrics(&self) -> AdmissionMetrics {
        let s = &self.stats;
        let total = s.total_requests.load(Ordering::Relaxed);
        let rejected = s.rejected_global.load(Ordering::Relaxed)
            + s.rejected_session.load(Ordering::Relaxed)
            + s.acquire_timeouts.load(Ordering::Relaxed);
        let completed = s.completed.load(Ordering::Relaxed);
        let session_occupancy = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let active = self
                    .config
                    .session_limit
                    .saturating_sub(entry.value().permits.available_permits());
                (active > 0).then(|| (entry.key().clone(), active))
            })
            .collect();

        AdmissionMetrics {
            total_requests: total,
            admitted: s.admitted.load(Ordering::Relaxed),
            rejected_global: s.rejected_global.load(Ordering::Relaxed),
            rejected_session: s.rejected_session.load(Ordering::Relaxed),
            acquire_timeouts: s.acquire_timeouts.load(Ordering::Relaxed),
            rejection_rate: if total == 0 { 0.0 } else { rejected as f64 / total as f64 },
            global_limit: self.config.global_limit,
            session_limit: self.config.session_limit,
            active_global: self.active_global(),
            session_count: self.sessions.len(),
            session_occupancy,
            avg_duration_ms: if completed == 0 {
                0.0
            } else {
                s.duration_sum_ms.load(Ordering::Relaxed) as f64 / completed as f64
            },
            queue_depth_p95: self.queue_depth_p95(),
            retry_after_secs: self.retry_after_secs(),
        }
    }
}
