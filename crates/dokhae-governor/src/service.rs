use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dokhae_common::request_context::new_correlation_id;
use dokhae_common::{CircuitState, RequestContext};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::admission::{Admission, AdmissionController, AdmissionMetrics, AdmissionPermit, Rejection};
use crate::analyzer::AnalyzerStage;
use crate::breaker::{BreakerStatus, CircuitBreaker};
use crate::budget::{BudgetMetrics, BudgetSummary, BudgetTracker, TimeoutBudgetManager, TrackerGuard};
use crate::config::GovernanceConfig;
use crate::error::GovernanceError;
use crate::health::{DiskSpaceProbe, HealthProbe, HealthReport, HealthSupervisor};
use crate::memory::{MemoryGovernor, MemoryMetrics, MemoryProbe, ProcessMemoryProbe, SegmentOutcome, SkippedSegment};
use crate::sampler::{MetricSummary, SysinfoProbe, SystemMetric, SystemProbe};
use crate::splitter::TextSegment;

/// How one stage attempt for a segment went.
#[derive(Debug, Clone, Serialize)]
pub struct StageAttempt {
    pub stage: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of the first stage that succeeded for a segment.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentAnalysis {
    pub stage: String,
    pub result: Value,
    pub attempts: Vec<StageAttempt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub correlation_id: String,
    pub session_id: String,
    pub cost: usize,
    pub segment_count: usize,
    pub segments: Vec<SegmentOutcome<SegmentAnalysis>>,
    pub skipped: Vec<SkippedSegment>,
    pub degraded: bool,
    pub budget: BudgetSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Admitted(AnalysisReport),
    Rejected(Rejection),
}

/// Point-in-time view for dashboards and `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct GovernanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub admission: AdmissionMetrics,
    pub budget: BudgetMetrics,
    pub memory: MemoryMetrics,
    pub circuits: Vec<BreakerStatus>,
    pub system: BTreeMap<&'static str, MetricSummary>,
    pub error_rate: f64,
}

/// Fails while the named dependency's circuit is open.
struct CircuitProbe {
    name: String,
    breaker: Arc<CircuitBreaker>,
}

#[async_trait]
impl HealthProbe for CircuitProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<()> {
        match self.breaker.state() {
            CircuitState::Open => anyhow::bail!("circuit open for {}", self.breaker.name()),
            _ => Ok(()),
        }
    }
}

/// Fails while process memory is over the governor's ceiling.
struct MemoryCeilingProbe {
    memory: Arc<MemoryGovernor>,
}

#[async_trait]
impl HealthProbe for MemoryCeilingProbe {
    fn name(&self) -> &str {
        "memory_ceiling"
    }

    async fn check(&self) -> anyhow::Result<()> {
        self.memory.check_memory("health_check")?;
        Ok(())
    }
}

/// Stops the periodic supervisor task.
pub struct SupervisorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "supervisor task ended abnormally");
        }
    }
}

/// Owns every governance component; request handlers share it behind an `Arc`.
pub struct GovernanceService {
    config: GovernanceConfig,
    admission: AdmissionController,
    budget: TimeoutBudgetManager,
    memory: Arc<MemoryGovernor>,
    health: HealthSupervisor,
    stages: Vec<Arc<dyn AnalyzerStage>>,
}

impl GovernanceService {
    pub fn new(config: GovernanceConfig, stages: Vec<Arc<dyn AnalyzerStage>>) -> Result<Arc<Self>, GovernanceError> {
        Self::with_probes(
            config,
            stages,
            Arc::new(ProcessMemoryProbe::new()),
            Arc::new(SysinfoProbe::new()),
        )
    }

    pub fn with_probes(
        config: GovernanceConfig,
        mut stages: Vec<Arc<dyn AnalyzerStage>>,
        memory_probe: Arc<dyn MemoryProbe>,
        system_probe: Arc<dyn SystemProbe>,
    ) -> Result<Arc<Self>, GovernanceError> {
        config.validate()?;

        // Execution order follows the allocation table; unknown stages run last.
        stages.sort_by_key(|s| {
            config
                .budget
                .stage_names()
                .position(|n| n == s.name())
                .unwrap_or(usize::MAX)
        });

        let memory = Arc::new(MemoryGovernor::new(config.memory.clone(), memory_probe)?);
        let health = HealthSupervisor::new(config.health.clone(), system_probe);
        for stage in &stages {
            let breaker = health
                .breakers()
                .register(stage.name(), config.health.analyzer_breaker);
            health.register_probe(Arc::new(CircuitProbe {
                name: format!("stage_{}", stage.name()),
                breaker,
            }));
        }
        health.register_probe(Arc::new(MemoryCeilingProbe {
            memory: memory.clone(),
        }));
        if config.health.min_free_disk_pct > 0.0 {
            health.register_probe(Arc::new(DiskSpaceProbe::new(
                config.health.disk_path.as_str(),
                config.health.min_free_disk_pct,
            )));
        }

        tracing::info!(
            stages = ?stages.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            global_limit = config.admission.global_limit,
            session_limit = config.admission.session_limit,
            total_budget_ms = config.budget.total_ms,
            split_threshold = config.memory.split_threshold,
            "governance service initialized"
        );

        Ok(Arc::new(Self {
            admission: AdmissionController::new(config.admission.clone()),
            budget: TimeoutBudgetManager::new(config.budget.clone()),
            memory,
            health,
            stages,
            config,
        }))
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn budget(&self) -> &TimeoutBudgetManager {
        &self.budget
    }

    pub fn memory(&self) -> &MemoryGovernor {
        &self.memory
    }

    pub fn health(&self) -> &HealthSupervisor {
        &self.health
    }

    fn context(&self, session_id: &str, text: &str, correlation_id: Option<&str>) -> RequestContext {
        let correlation_id = correlation_id
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_correlation_id);
        RequestContext::new(session_id, correlation_id, text)
            .with_budgets(self.config.budget.total_ms, self.config.memory.memory_limit_mb)
    }

    /// Fail-fast entry point: rejects immediately when either ceiling is full.
    pub async fn submit(
        &self,
        session_id: &str,
        text: &str,
        correlation_id: Option<&str>,
    ) -> Result<SubmitOutcome, GovernanceError> {
        let ctx = self.context(session_id, text, correlation_id);
        // The budget clock starts at arrival.
        let guard = self.budget.track(&ctx.correlation_id);
        match self.admission.try_admit(&ctx) {
            Admission::Admitted(permit) => self.process(ctx, guard, permit).await,
            Admission::Rejected(rejection) => Ok(SubmitOutcome::Rejected(rejection)),
        }
    }

    /// Like `submit`, but waits up to the configured acquire timeout for slots.
    pub async fn submit_with_wait(
        &self,
        session_id: &str,
        text: &str,
        correlation_id: Option<&str>,
    ) -> Result<SubmitOutcome, GovernanceError> {
        let ctx = self.context(session_id, text, correlation_id);
        let guard = self.budget.track(&ctx.correlation_id);
        match self
            .admission
            .acquire(&ctx, self.config.admission.acquire_timeout())
            .await
        {
            Admission::Admitted(permit) => self.process(ctx, guard, permit).await,
            Admission::Rejected(rejection) => Ok(SubmitOutcome::Rejected(rejection)),
        }
    }

    async fn process(
        &self,
        ctx: RequestContext,
        guard: TrackerGuard,
        permit: AdmissionPermit,
    ) -> Result<SubmitOutcome, GovernanceError> {
        let started = Instant::now();
        let result = self.run_pipeline(&ctx, &guard).await;
        self.admission.release(permit, started.elapsed());

        match result {
            Ok(report) => {
                tracing::info!(
                    correlation_id = %ctx.correlation_id,
                    session_id = %ctx.session_id,
                    segments = report.segment_count,
                    degraded = report.degraded,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request completed"
                );
                Ok(SubmitOutcome::Admitted(report))
            }
            Err(err) => {
                tracing::warn!(
                    correlation_id = %ctx.correlation_id,
                    session_id = %ctx.session_id,
                    error = %err,
                    "request failed"
                );
                self.health
                    .record_error("pipeline", Some(&ctx.correlation_id), err.to_string());
                Err(err)
            }
        }
    }

    async fn run_pipeline(&self, ctx: &RequestContext, guard: &TrackerGuard) -> Result<AnalysisReport, GovernanceError> {
        let segments = self.memory.prepare_context(ctx)?;
        let segment_count = segments.len();
        let tracker = guard.tracker();

        let run = self
            .memory
            .process_with_memory_control(segments, |segment| async move {
                self.analyze_segment(tracker, &segment).await
            })
            .await?;

        Ok(AnalysisReport {
            correlation_id: ctx.correlation_id.clone(),
            session_id: ctx.session_id.clone(),
            cost: ctx.cost_estimate().unwrap_or(0),
            segment_count,
            degraded: run.is_degraded(),
            segments: run.outcomes,
            skipped: run.skipped,
            budget: tracker.summary(),
        })
    }

    /// Walks the stage chain for one segment and returns the first success.
    ///
    /// Open circuits are skipped, failures and stage timeouts fall through to
    /// the next stage, an exhausted budget ends the chain.
    async fn analyze_segment(&self, tracker: &BudgetTracker, segment: &TextSegment) -> Result<SegmentAnalysis, GovernanceError> {
        let mut attempts = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let name = stage.name();
            if !self.health.check(name) {
                let err = GovernanceError::CircuitOpen {
                    dependency: name.to_string(),
                };
                tracing::debug!(
                    correlation_id = %tracker.correlation_id(),
                    stage = name,
                    "circuit open, skipping stage"
                );
                attempts.push(StageAttempt {
                    stage: name.to_string(),
                    outcome: err.kind(),
                    error: Some(err.to_string()),
                });
                continue;
            }

            let error = match self.budget.run_stage(tracker, name, stage.analyze(&segment.text)).await {
                Ok(Ok(result)) => {
                    self.health.record_success(name);
                    attempts.push(StageAttempt {
                        stage: name.to_string(),
                        outcome: "ok",
                        error: None,
                    });
                    return Ok(SegmentAnalysis {
                        stage: name.to_string(),
                        result,
                        attempts,
                    });
                }
                Ok(Err(err)) => ("failed", err.to_string()),
                Err(err @ GovernanceError::StageTimeout { .. }) => ("timeout", err.to_string()),
                Err(err) => return Err(err),
            };

            self.health.record_failure(name);
            self.health
                .record_error(name, Some(tracker.correlation_id()), error.1.clone());
            tracing::warn!(
                correlation_id = %tracker.correlation_id(),
                segment_id = segment.id,
                stage = name,
                error = %error.1,
                "stage failed, falling back"
            );
            attempts.push(StageAttempt {
                stage: name.to_string(),
                outcome: error.0,
                error: Some(error.1),
            });
        }

        Err(GovernanceError::AllStagesFailed {
            segment_id: segment.id,
        })
    }

    pub fn snapshot(&self) -> GovernanceSnapshot {
        GovernanceSnapshot {
            timestamp: Utc::now(),
            admission: self.admission.metrics(),
            budget: self.budget.metrics(),
            memory: self.memory.metrics(),
            circuits: self.health.breakers().statuses(),
            system: self
                .health
                .metric_summaries()
                .into_iter()
                .map(|(m, s)| (m.as_str(), s))
                .collect(),
            error_rate: self.health.error_rate(),
        }
    }

    pub async fn health_report(&self) -> HealthReport {
        self.health.health_report().await
    }

    /// One supervisor tick: system sample, queue depth, idle-session sweep.
    pub fn supervise_once(&self) {
        self.health.collect_metrics();
        let depth = self.admission.sample_queue_depth();
        self.health.record_metric(SystemMetric::QueueDepth, depth as f64);
        self.admission
            .cleanup_idle_sessions(self.config.admission.session_idle());
    }

    /// Spawns the periodic supervisor. It stops when the handle is shut down
    /// or the service is dropped.
    pub fn start_supervisor(self: &Arc<Self>) -> SupervisorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let service: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health.sample_interval();

        let task = tokio::spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "supervisor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(svc) = service.upgrade() else {
                    break;
                };
                svc.supervise_once();
            }
            tracing::info!("supervisor stopped");
        });

        SupervisorHandle { cancel, task }
    }
}
