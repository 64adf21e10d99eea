pub mod admission;
pub mod analyzer;
pub mod breaker;
pub mod budget;
pub mod config;
pub mod error;
pub mod estimator;
pub mod health;
pub mod memory;
pub mod sampler;
pub mod service;
pub mod splitter;

pub use admission::{Admission, AdmissionController, AdmissionPermit, Rejection};
pub use analyzer::{AnalyzerStage, HeuristicAnalyzer};
pub use budget::{BudgetTracker, TimeoutBudgetManager};
pub use config::GovernanceConfig;
pub use error::{GovernanceError, RejectReason};
pub use health::{HealthProbe, HealthReport, HealthSupervisor};
pub use memory::{MemoryGovernor, MemoryProbe, ProcessMemoryProbe};
pub use service::{AnalysisReport, GovernanceService, GovernanceSnapshot, SubmitOutcome, SupervisorHandle};
