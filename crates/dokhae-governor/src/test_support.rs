use std::sync::Arc;

use async_trait::async_trait;
use dokhae_governor::sampler::{SystemProbe, SystemSnapshot};
use dokhae_governor::{AnalyzerStage, GovernanceConfig, GovernanceService, MemoryProbe};
use serde_json::Value;

use crate::metrics::Metrics;
use crate::state::AppState;

pub struct EchoStage;

#[async_trait]
impl AnalyzerStage for EchoStage {
    fn name(&self) -> &str {
        "primary"
    }

    async fn analyze(&self, text: &str) -> anyhow::Result<Value> {
        Ok(serde_json::json!({ "chars": text.chars().count() }))
    }
}

/// Takes a second per call, far past any test budget.
pub struct SlowStage(pub &'static str);

#[async_trait]
impl AnalyzerStage for SlowStage {
    fn name(&self) -> &str {
        self.0
    }

    async fn analyze(&self, _text: &str) -> anyhow::Result<Value> {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        Ok(Value::Null)
    }
}

/// Reports a fixed 10 MB resident size.
pub struct SteadyMemory;

impl MemoryProbe for SteadyMemory {
    fn current_bytes(&self) -> Option<u64> {
        Some(10 * 1024 * 1024)
    }

    fn reclaim(&self) {}
}

pub struct QuietSystem;

impl SystemProbe for QuietSystem {
    fn sample(&self) -> SystemSnapshot {
        SystemSnapshot {
            cpu_percent: 5.0,
            resident_memory_mb: 10.0,
            memory_percent: 1.0,
            thread_count: 4,
        }
    }
}

pub fn echo() -> Arc<dyn AnalyzerStage> {
    Arc::new(EchoStage)
}

pub fn slow(name: &'static str) -> Arc<dyn AnalyzerStage> {
    Arc::new(SlowStage(name))
}

pub fn app_state(config: GovernanceConfig, stages: Vec<Arc<dyn AnalyzerStage>>, max_body_bytes: usize) -> AppState {
    let service =
        GovernanceService::with_probes(config, stages, Arc::new(SteadyMemory), Arc::new(QuietSystem)).unwrap();
    AppState {
        service,
        metrics: Arc::new(Metrics::default()),
        max_body_bytes,
    }
}
