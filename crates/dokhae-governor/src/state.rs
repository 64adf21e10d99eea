use std::sync::Arc;

use dokhae_governor::GovernanceService;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GovernanceService>,
    pub metrics: Arc<Metrics>,
    pub max_body_bytes: usize,
}
