use serde::{Deserialize, Serialize};

/// Outcome of a non-blocking admission check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admit,
    RejectGlobal,
    RejectSession,
}

impl AdmissionDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            AdmissionDecision::Admit => "admit",
            AdmissionDecision::RejectGlobal => "reject_global_limit",
            AdmissionDecision::RejectSession => "reject_session_limit",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; calls flow through.
    #[default]
    Closed,
    /// Failing; calls are refused until the recovery timeout elapses.
    Open,
    /// Recovery timeout elapsed; a trial call decides the next state.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding used by the Prometheus gauge.
    pub fn as_gauge(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

/// Aggregated service health, ordered from best to worst.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
        }
    }

    /// Whether callers should still route traffic here.
    pub fn is_serving(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}
