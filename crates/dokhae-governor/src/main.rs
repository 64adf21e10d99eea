mod args;
mod handlers;
mod metrics;
mod state;
mod upstream;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::Parser;
use dokhae_common::telemetry::{init_tracing, LogFormat};
use dokhae_governor::{AnalyzerStage, GovernanceService, HeuristicAnalyzer};

use crate::args::Args;
use crate::handlers::{analyze, health, healthz};
use crate::metrics::{metrics_handler, snapshot_handler, track_requests};
use crate::state::AppState;
use crate::upstream::HttpAnalyzer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_format = LogFormat::parse(&args.log_format).map_err(anyhow::Error::msg)?;
    let tracer_provider = init_tracing(
        "dokhae-governor",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        log_format,
    );

    let config = args.governance_config()?;

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .build()?;

    let mut stages: Vec<Arc<dyn AnalyzerStage>> = Vec::new();
    if let Some(url) = args.primary_url.as_deref() {
        stages.push(Arc::new(HttpAnalyzer::new("primary", url, http.clone())));
    } else {
        tracing::warn!("primary analyzer url not set, primary stage disabled");
    }
    if let Some(url) = args.secondary_url.as_deref() {
        stages.push(Arc::new(HttpAnalyzer::new("secondary", url, http.clone())));
    }
    stages.push(Arc::new(HeuristicAnalyzer));

    let service = GovernanceService::new(config, stages)?;
    let supervisor = service.start_supervisor();

    let st = AppState {
        service,
        metrics: Arc::new(metrics::Metrics::default()),
        max_body_bytes: args.max_body_bytes,
    };

    let app = Router::new()
        .route("/v1/analyze", post(analyze))
        .route("/v1/metrics", get(snapshot_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(listen_addr = %args.listen_addr, "dokhae-governor listening");

    let shutdown = supervisor.token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    supervisor.shutdown().await;
    if let Some(provider) = tracer_provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to shut down tracer provider: {e}");
        }
    }
    Ok(())
}
