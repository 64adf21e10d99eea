use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dokhae_governor::GovernanceSnapshot;

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    pub request_too_large: AtomicU64,
}

fn metric(body: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = write!(
        body,
        "# HELP dokhae_{name} {help}\n# TYPE dokhae_{name} {kind}\ndokhae_{name} {value}\n"
    );
}

/// Escapes a Prometheus label value.
fn label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

pub fn render_metrics(metrics: &Metrics, snapshot: &GovernanceSnapshot) -> String {
    let mut body = String::new();
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

    metric(&mut body, "http_requests_total", "counter", "Total HTTP requests handled.", load(&metrics.requests_total));
    metric(&mut body, "http_requests_inflight", "gauge", "Currently in-flight HTTP requests.", load(&metrics.requests_inflight));
    metric(&mut body, "http_responses_2xx", "counter", "Total 2xx responses.", load(&metrics.status_2xx));
    metric(&mut body, "http_responses_4xx", "counter", "Total 4xx responses.", load(&metrics.status_4xx));
    metric(&mut body, "http_responses_5xx", "counter", "Total 5xx responses.", load(&metrics.status_5xx));
    metric(&mut body, "http_request_too_large_total", "counter", "Request bodies over the size limit.", load(&metrics.request_too_large));

    let a = &snapshot.admission;
    metric(&mut body, "admission_requests_total", "counter", "Admission attempts.", a.total_requests);
    metric(&mut body, "admission_admitted_total", "counter", "Admitted requests.", a.admitted);
    metric(&mut body, "admission_rejected_global_total", "counter", "Rejections at the global ceiling.", a.rejected_global);
    metric(&mut body, "admission_rejected_session_total", "counter", "Rejections at a session ceiling.", a.rejected_session);
    metric(&mut body, "admission_acquire_timeouts_total", "counter", "Bounded waits that ran out.", a.acquire_timeouts);
    metric(&mut body, "admission_active_global", "gauge", "Global slots in use.", a.active_global);
    metric(&mut body, "admission_global_limit", "gauge", "Global slot ceiling.", a.global_limit);
    metric(&mut body, "admission_sessions", "gauge", "Tracked sessions.", a.session_count);
    metric(&mut body, "admission_queue_depth_p95", "gauge", "p95 of sampled global occupancy.", a.queue_depth_p95);
    metric(&mut body, "admission_retry_after_seconds", "gauge", "Current retry hint.", a.retry_after_secs);
    body.push_str("# HELP dokhae_admission_session_active Slots held per session.\n# TYPE dokhae_admission_session_active gauge\n");
    for (session, held) in &a.session_occupancy {
        let _ = writeln!(body, "dokhae_admission_session_active{{session=\"{}\"}} {}", label(session), held);
    }

    let b = &snapshot.budget;
    metric(&mut body, "budget_active_trackers", "gauge", "Live request budgets.", b.active_trackers);
    metric(&mut body, "budget_avg_remaining_ms", "gauge", "Average remaining budget of live requests.", b.avg_remaining_ms);
    metric(&mut body, "budget_exhausted_total", "counter", "Stages refused for lack of budget.", b.budget_exhausted);
    metric(&mut body, "budget_stage_timeouts_total", "counter", "Stages that ran past their deadline.", b.stage_timeouts);

    let m = &snapshot.memory;
    metric(&mut body, "memory_limit_mb", "gauge", "Memory ceiling.", m.limit_mb);
    metric(&mut body, "memory_current_mb", "gauge", "Resident memory.", m.current_mb);
    metric(&mut body, "memory_peak_mb", "gauge", "Peak resident memory seen.", m.peak_mb);
    metric(&mut body, "memory_utilization_percent", "gauge", "Resident memory as a share of the ceiling.", m.utilization_pct);
    metric(&mut body, "memory_reclaims_total", "counter", "Reclaim passes run.", m.reclaims);
    metric(&mut body, "memory_skipped_segments_total", "counter", "Segments left out of results.", m.skipped_segments);

    metric(&mut body, "error_rate", "gauge", "Errors per second over the trailing window.", snapshot.error_rate);

    body.push_str("# HELP dokhae_circuit_state Circuit state (0 closed, 1 half-open, 2 open).\n# TYPE dokhae_circuit_state gauge\n");
    for c in &snapshot.circuits {
        let _ = writeln!(body, "dokhae_circuit_state{{dependency=\"{}\"}} {}", label(&c.name), c.state.as_gauge());
    }
    body.push_str("# HELP dokhae_circuit_failures Consecutive failures per dependency.\n# TYPE dokhae_circuit_failures gauge\n");
    for c in &snapshot.circuits {
        let _ = writeln!(body, "dokhae_circuit_failures{{dependency=\"{}\"}} {}", label(&c.name), c.failure_count);
    }

    body
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let body = render_metrics(&st.metrics, &st.service.snapshot());
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub async fn snapshot_handler(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.service.snapshot())
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dokhae_common::RequestContext;
    use dokhae_governor::GovernanceConfig;

    use crate::test_support::{app_state, echo};

    #[test]
    fn test_label_escaping() {
        assert_eq!(label(r#"a"b\c"#), r#"a\"b\\c"#);
        assert_eq!(label("x\ny"), "x\\ny");
    }

    #[tokio::test]
    async fn test_render_includes_occupancy_and_utilization() {
        let st = app_state(GovernanceConfig::default(), vec![echo()], 1024);
        let admission = st.service.admission();
        let _a = admission.try_admit(&RequestContext::new("s1", "c1", "x")).into_result().unwrap();
        let _b = admission.try_admit(&RequestContext::new("s1", "c2", "x")).into_result().unwrap();
        let _c = admission.try_admit(&RequestContext::new("s2", "c3", "x")).into_result().unwrap();

        let body = render_metrics(&st.metrics, &st.service.snapshot());
        assert!(body.contains("dokhae_admission_session_active{session=\"s1\"} 2\n"));
        assert!(body.contains("dokhae_admission_session_active{session=\"s2\"} 1\n"));
        // 10 MB resident against the 100 MB default ceiling
        assert!(body.contains("dokhae_memory_utilization_percent 10\n"));
        assert!(body.contains("dokhae_admission_active_global 3\n"));
        assert!(body.contains("dokhae_circuit_state{dependency=\"primary\"} 0\n"));
    }
}
