use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use dokhae_governor::{GovernanceError, Rejection, SubmitOutcome};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn health(State(st): State<AppState>) -> Response {
    let report = st.service.health_report().await;
    let status = if report.status.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Body fields win over `x-session-id` / `x-correlation-id` headers.
pub fn parse_request(headers: &HeaderMap, body: &[u8]) -> Result<AnalyzeRequest, String> {
    let mut req: AnalyzeRequest = serde_json::from_slice(body).map_err(|e| format!("invalid request body: {e}"))?;
    if req.session_id.as_deref().map_or(true, str::is_empty) {
        req.session_id = header_str(headers, "x-session-id").map(str::to_string);
    }
    if req.session_id.is_none() {
        return Err("session_id is required (body field or x-session-id header)".to_string());
    }
    if req.correlation_id.is_none() {
        req.correlation_id = header_str(headers, "x-correlation-id").map(str::to_string);
    }
    Ok(req)
}

fn error_body(kind: &str, message: String) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": kind, "message": message }))
}

pub fn rejection_response(rejection: Rejection) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, rejection.retry_after_secs.to_string())],
        Json(serde_json::json!({
            "error": "admission_rejected",
            "reason": rejection.reason,
            "retry_after_secs": rejection.retry_after_secs,
        })),
    )
        .into_response()
}

pub fn status_for_error(err: &GovernanceError) -> StatusCode {
    match err {
        GovernanceError::AdmissionRejected { .. } => StatusCode::TOO_MANY_REQUESTS,
        GovernanceError::TextTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        GovernanceError::EmptyInput => StatusCode::BAD_REQUEST,
        GovernanceError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
        GovernanceError::BudgetExhausted { .. }
        | GovernanceError::StageTimeout { .. }
        | GovernanceError::MemoryLimitExceeded { .. }
        | GovernanceError::CircuitOpen { .. }
        | GovernanceError::AllStagesFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(err: &GovernanceError, retry_after_secs: u64) -> Response {
    let status = status_for_error(err);
    let body = error_body(err.kind(), err.to_string());
    if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::TOO_MANY_REQUESTS {
        (status, [(header::RETRY_AFTER, retry_after_secs.to_string())], body).into_response()
    } else {
        (status, body).into_response()
    }
}

pub async fn analyze(State(st): State<AppState>, headers: HeaderMap, req: Request<Body>) -> Response {
    let body = match axum::body::to_bytes(req.into_body(), st.max_body_bytes).await {
        Ok(b) => b,
        Err(_) => {
            st.metrics
                .request_too_large
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let parsed = match parse_request(&headers, &body) {
        Ok(r) => r,
        Err(msg) => return (StatusCode::BAD_REQUEST, error_body("bad_request", msg)).into_response(),
    };
    let session_id = parsed.session_id.unwrap_or_default();

    match st
        .service
        .submit(&session_id, &parsed.text, parsed.correlation_id.as_deref())
        .await
    {
        Ok(SubmitOutcome::Admitted(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(SubmitOutcome::Rejected(rejection)) => {
            tracing::warn!(
                session_id = %session_id,
                reason = %rejection.reason,
                retry_after_secs = rejection.retry_after_secs,
                "request rejected"
            );
            rejection_response(rejection)
        }
        Err(err) => error_response(&err, st.service.admission().retry_after_secs()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use dokhae_common::{AdmissionDecision, RequestContext};
    use dokhae_governor::{GovernanceConfig, RejectReason};
    use serde_json::Value;

    use crate::test_support::{app_state, echo, slow};

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/analyze")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_session_header_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", HeaderValue::from_static("s-9"));
        headers.insert("x-correlation-id", HeaderValue::from_static("c-1"));

        let req = parse_request(&headers, r#"{"text":"안녕"}"#.as_bytes()).unwrap();
        assert_eq!(req.session_id.as_deref(), Some("s-9"));
        assert_eq!(req.correlation_id.as_deref(), Some("c-1"));

        let body = r#"{"text":"안녕","session_id":"s-1","correlation_id":"c-2"}"#;
        let req = parse_request(&headers, body.as_bytes()).unwrap();
        assert_eq!(req.session_id.as_deref(), Some("s-1"));
        assert_eq!(req.correlation_id.as_deref(), Some("c-2"));
    }

    #[test]
    fn test_missing_session_or_text() {
        let headers = HeaderMap::new();
        assert!(parse_request(&headers, r#"{"text":"안녕"}"#.as_bytes()).is_err());
        assert!(parse_request(&headers, br#"{"session_id":"s"}"#).is_err());
        assert!(parse_request(&headers, b"not json").is_err());
    }

    #[test]
    fn test_rejection_sets_retry_after() {
        let resp = rejection_response(Rejection {
            reason: RejectReason::SessionLimit,
            decision: AdmissionDecision::RejectSession,
            retry_after_secs: 7,
        });
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "7");
    }

    #[test]
    fn test_error_status_mapping() {
        let too_large = GovernanceError::TextTooLarge {
            cost: 9000,
            max_cost: 4000,
        };
        assert_eq!(status_for_error(&too_large), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(error_response(&too_large, 5).headers().get(header::RETRY_AFTER).is_none());

        let exhausted = GovernanceError::BudgetExhausted {
            correlation_id: "c".into(),
        };
        let resp = error_response(&exhausted, 4);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "4");

        assert_eq!(status_for_error(&GovernanceError::EmptyInput), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_analyze_uses_session_header() {
        let st = app_state(GovernanceConfig::default(), vec![echo()], 1024);
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", HeaderValue::from_static("hdr-session"));

        let resp = analyze(State(st.clone()), headers, post(r#"{"text":"안녕하세요."}"#)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["session_id"], "hdr-session");
        assert!(body["correlation_id"].as_str().unwrap().starts_with("req_"));
        assert_eq!(body["segments"][0]["value"]["stage"], "primary");

        assert_eq!(st.service.admission().active_global(), 0);
        assert_eq!(st.service.budget().active_trackers(), 0);
    }

    #[tokio::test]
    async fn test_analyze_rejects_oversized_body() {
        let st = app_state(GovernanceConfig::default(), vec![echo()], 16);
        let body = format!(r#"{{"session_id":"s1","text":"{}"}}"#, "가".repeat(64));

        let resp = analyze(State(st.clone()), HeaderMap::new(), post(&body)).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(st.metrics.request_too_large.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(st.service.admission().metrics().total_requests, 0);
    }

    #[tokio::test]
    async fn test_analyze_full_service_returns_429() {
        let mut config = GovernanceConfig::default();
        config.admission.global_limit = 1;
        let st = app_state(config, vec![echo()], 1024);
        let _held = st
            .service
            .admission()
            .try_admit(&RequestContext::new("other", "c0", "x"))
            .into_result()
            .unwrap();

        let resp = analyze(State(st.clone()), HeaderMap::new(), post(r#"{"session_id":"s1","text":"안녕"}"#)).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        // no completed request yet, so the default hint applies
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "5");
        let body = json_body(resp).await;
        assert_eq!(body["reason"], "global_limit");
        assert_eq!(body["retry_after_secs"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_analyze_exhausted_budget_returns_503() {
        let mut config = GovernanceConfig::default();
        config.budget.total_ms = 100;
        let st = app_state(config, vec![slow("primary"), slow("secondary")], 1024);

        let resp = analyze(State(st.clone()), HeaderMap::new(), post(r#"{"session_id":"s1","text":"안녕"}"#)).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        // one 100ms request completed: ceil(0.1 * 1.5) = 1
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "1");
        let body = json_body(resp).await;
        assert_eq!(body["error"], "budget_exhausted");
        assert_eq!(st.service.admission().active_session("s1"), 0);
    }
}
