use serde::Serialize;

/// Why an inbound request was turned away.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    GlobalLimit,
    SessionLimit,
    /// Bounded wait in `acquire` ran out.
    AcquireTimeout,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::GlobalLimit => "global_limit",
            RejectReason::SessionLimit => "session_limit",
            RejectReason::AcquireTimeout => "acquire_timeout",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GovernanceError {
    #[error("admission rejected ({reason}), retry after {retry_after_secs}s")]
    AdmissionRejected {
        reason: RejectReason,
        retry_after_secs: u64,
    },

    #[error("timeout budget exhausted for {correlation_id}")]
    BudgetExhausted { correlation_id: String },

    #[error("stage {stage} timed out after {deadline_ms}ms")]
    StageTimeout { stage: String, deadline_ms: u64 },

    #[error("text too large: {cost} > {max_cost} cost units")]
    TextTooLarge { cost: usize, max_cost: usize },

    #[error("memory limit exceeded: {current_mb:.1}MB > {limit_mb}MB in {context}")]
    MemoryLimitExceeded {
        current_mb: f64,
        limit_mb: u64,
        context: String,
    },

    #[error("circuit open for {dependency}")]
    CircuitOpen { dependency: String },

    #[error("input text is empty")]
    EmptyInput,

    #[error("every analyzer stage failed for segment {segment_id}")]
    AllStagesFailed { segment_id: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GovernanceError {
    /// Errors the caller may retry or route around.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GovernanceError::AdmissionRejected { .. }
                | GovernanceError::StageTimeout { .. }
                | GovernanceError::MemoryLimitExceeded { .. }
                | GovernanceError::CircuitOpen { .. }
                | GovernanceError::AllStagesFailed { .. }
        )
    }

    /// Errors that abort the rest of the current request's chain.
    pub fn is_fatal_for_request(&self) -> bool {
        matches!(
            self,
            GovernanceError::BudgetExhausted { .. }
                | GovernanceError::TextTooLarge { .. }
                | GovernanceError::EmptyInput
                | GovernanceError::InvalidConfig(_)
        )
    }

    /// Short machine-readable name, used for metrics labels and response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GovernanceError::AdmissionRejected { .. } => "admission_rejected",
            GovernanceError::BudgetExhausted { .. } => "budget_exhausted",
            GovernanceError::StageTimeout { .. } => "stage_timeout",
            GovernanceError::TextTooLarge { .. } => "text_too_large",
            GovernanceError::MemoryLimitExceeded { .. } => "memory_limit_exceeded",
            GovernanceError::CircuitOpen { .. } => "circuit_open",
            GovernanceError::EmptyInput => "empty_input",
            GovernanceError::AllStagesFailed { .. } => "all_stages_failed",
            GovernanceError::InvalidConfig(_) => "invalid_config",
        }
    }
}
