pub mod request_context;
pub mod status;

pub use request_context::RequestContext;
pub use status::{AdmissionDecision, CircuitState, HealthStatus};

pub mod telemetry;
