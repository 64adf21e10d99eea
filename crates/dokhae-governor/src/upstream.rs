use async_trait::async_trait;
use dokhae_governor::AnalyzerStage;
use serde_json::Value;

fn classify_reqwest_error(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        return "timeout";
    }
    if error.is_connect() {
        return "connect";
    }
    "other"
}

/// Remote analyzer reached over HTTP: POST `{"text": ...}`, JSON back.
///
/// No client-side timeout is set; the stage deadline bounds each call.
pub struct HttpAnalyzer {
    name: String,
    url: String,
    http: reqwest::Client,
}

impl HttpAnalyzer {
    pub fn new(name: impl Into<String>, url: &str, http: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            url: url.trim_end_matches('/').to_string(),
            http,
        }
    }
}

#[async_trait]
impl AnalyzerStage for HttpAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(&self, text: &str) -> anyhow::Result<Value> {
        let resp = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(
                    stage = %self.name,
                    url = %self.url,
                    kind = classify_reqwest_error(&e),
                    error = %e,
                    "upstream analyzer request failed"
                );
                anyhow::anyhow!("{} request failed ({}): {e}", self.name, classify_reqwest_error(&e))
            })?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("{} returned {}", self.name, status);
        }
        Ok(resp.json::<Value>().await?)
    }
}
