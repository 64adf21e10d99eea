use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Per-call envelope handed to the governance core.
///
/// Everything except the memoized cost estimate is fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub session_id: String,
    pub correlation_id: String,
    pub text: String,
    pub timeout_budget_ms: u64,
    pub memory_budget_mb: u64,
    #[serde(skip)]
    cost_estimate: OnceLock<usize>,
}

impl RequestContext {
    pub fn new(session_id: impl Into<String>, correlation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            correlation_id: correlation_id.into(),
            text: text.into(),
            timeout_budget_ms: 5000,
            memory_budget_mb: 100,
            cost_estimate: OnceLock::new(),
        }
    }

    pub fn with_budgets(mut self, timeout_budget_ms: u64, memory_budget_mb: u64) -> Self {
        self.timeout_budget_ms = timeout_budget_ms;
        self.memory_budget_mb = memory_budget_mb;
        self
    }

    /// Returns the cost estimate, computing it with `estimate` on first use only.
    pub fn cost_estimate_with<F>(&self, estimate: F) -> usize
    where
        F: FnOnce(&str) -> usize,
    {
        *self.cost_estimate.get_or_init(|| estimate(&self.text))
    }

    /// The memoized estimate, if one was computed.
    pub fn cost_estimate(&self) -> Option<usize> {
        self.cost_estimate.get().copied()
    }
}

/// Random id for correlating log lines and budget trackers of one request.
pub fn new_correlation_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4())
}
