use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dokhae_common::CircuitState;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
    times_opened: u64,
}

/// Failure tracking for one dependency.
///
/// Transitions: Closed -> Open after `failure_threshold` consecutive failures;
/// Open -> HalfOpen on the first `check` after the recovery timeout;
/// HalfOpen -> Closed on success, back to Open on failure.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub times_opened: u64,
    pub secs_since_last_failure: Option<f64>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a call may go through now.
    pub fn check(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let ready = inner
                    .next_attempt
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if ready {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(dependency = %self.name, "circuit half-open, allowing trial call");
                }
                ready
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.next_attempt = None;
            tracing::info!(dependency = %self.name, "circuit closed");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(now);

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.next_attempt = Some(now + self.config.recovery_timeout());
            inner.times_opened += 1;
            tracing::warn!(
                dependency = %self.name,
                failure_count = inner.failure_count,
                recovery_ms = self.config.recovery_timeout_ms,
                "circuit opened"
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            times_opened: inner.times_opened,
            secs_since_last_failure: inner.last_failure.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}

/// One breaker per dependency name, created on first use.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: DashMap::new(),
        }
    }

    /// Registers `name` with its own settings, replacing any existing breaker.
    pub fn register(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers.insert(name.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.get(name) {
            return b.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config)))
            .clone()
    }

    pub fn check(&self, name: &str) -> bool {
        self.get(name).check()
    }

    pub fn record_success(&self, name: &str) {
        self.get(name).record_success();
    }

    pub fn record_failure(&self, name: &str) {
        self.get(name).record_failure();
    }

    /// Status of every breaker, sorted by name.
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut out: Vec<BreakerStatus> = self.breakers.iter().map(|b| b.status()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "primary",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_ms: 60_000,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let b = breaker(3);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.check());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.check());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let b = breaker(3);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.status().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_only_after_recovery_timeout() {
        let b = breaker(1);
        b.record_failure();
        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert!(!b.check());
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(b.check());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        // trial in progress
        assert!(b.check());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_outcomes() {
        let b = breaker(1);
        b.record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(b.check());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        // fresh recovery timeout
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!b.check());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(b.check());
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.status().times_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_while_open_does_not_close() {
        let b = breaker(1);
        b.record_failure();
        b.record_success();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_is_per_dependency() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            recovery_timeout_ms: 1000,
        });
        registry.record_failure("secondary");
        registry.record_failure("secondary");
        assert!(!registry.check("secondary"));
        assert!(registry.check("tertiary"));

        registry.register("primary", BreakerConfig {
            failure_threshold: 1,
            recovery_timeout_ms: 1000,
        });
        registry.record_failure("primary");
        assert!(!registry.check("primary"));

        let names: Vec<String> = registry.statuses().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["primary", "secondary", "tertiary"]);
    }
}
