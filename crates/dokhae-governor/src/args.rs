use std::path::PathBuf;

use clap::Parser;
use dokhae_governor::GovernanceConfig;

#[derive(Debug, Parser)]
#[command(name = "dokhae-governor", about = "Resource-governed Korean text analysis gateway")]
pub struct Args {
    #[arg(long, env = "DOKHAE_LISTEN_ADDR", default_value = "0.0.0.0:18090")]
    pub listen_addr: String,

    /// JSON file with a full or partial `GovernanceConfig`; flags override it.
    #[arg(long, env = "DOKHAE_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "DOKHAE_GLOBAL_LIMIT")]
    pub global_limit: Option<usize>,

    #[arg(long, env = "DOKHAE_SESSION_LIMIT")]
    pub session_limit: Option<usize>,

    #[arg(long, env = "DOKHAE_TOTAL_BUDGET_MS")]
    pub total_budget_ms: Option<u64>,

    #[arg(long, env = "DOKHAE_MEMORY_LIMIT_MB")]
    pub memory_limit_mb: Option<u64>,

    #[arg(long, env = "DOKHAE_SPLIT_THRESHOLD")]
    pub split_threshold: Option<usize>,

    /// hangul_weighted | char_count
    #[arg(long, env = "DOKHAE_COST_ESTIMATOR")]
    pub estimator: Option<String>,

    #[arg(long, env = "DOKHAE_SAMPLE_INTERVAL_MS")]
    pub sample_interval_ms: Option<u64>,

    /// Upstream analyzer tried first.
    #[arg(long, env = "DOKHAE_PRIMARY_URL")]
    pub primary_url: Option<String>,

    #[arg(long, env = "DOKHAE_SECONDARY_URL")]
    pub secondary_url: Option<String>,

    /// Max request body size in bytes.
    #[arg(long, env = "DOKHAE_MAX_BODY_BYTES", default_value_t = 1024 * 1024)]
    pub max_body_bytes: usize,

    /// text | json
    #[arg(long, env = "DOKHAE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// OTLP/HTTP collector base URL; span export is off when unset.
    #[arg(long, env = "DOKHAE_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "DOKHAE_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    /// File config (or defaults) with any explicitly set flags on top.
    pub fn governance_config(&self) -> anyhow::Result<GovernanceConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
                serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?
            }
            None => GovernanceConfig::default(),
        };

        if let Some(v) = self.global_limit {
            config.admission.global_limit = v;
        }
        if let Some(v) = self.session_limit {
            config.admission.session_limit = v;
        }
        if let Some(v) = self.total_budget_ms {
            config.budget.total_ms = v;
        }
        if let Some(v) = self.memory_limit_mb {
            config.memory.memory_limit_mb = v;
        }
        if let Some(v) = self.split_threshold {
            config.memory.split_threshold = v;
        }
        if let Some(v) = &self.estimator {
            config.memory.estimator = v.clone();
        }
        if let Some(v) = self.sample_interval_ms {
            config.health.sample_interval_ms = v;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "dokhae-governor",
            "--global-limit",
            "16",
            "--split-threshold",
            "500",
            "--estimator",
            "char_count",
        ]);
        let config = args.governance_config().unwrap();
        assert_eq!(config.admission.global_limit, 16);
        assert_eq!(config.admission.session_limit, 100);
        assert_eq!(config.memory.split_threshold, 500);
        assert_eq!(config.memory.estimator, "char_count");
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = Args::parse_from(["dokhae-governor", "--session-limit", "0"]);
        assert!(args.governance_config().is_err());
    }

    #[test]
    fn test_config_file_is_overlaid() {
        let path = std::env::temp_dir().join(format!("dokhae-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"admission":{"global_limit":8},"budget":{"total_ms":3000}}"#).unwrap();
        let args = Args::parse_from([
            "dokhae-governor".to_string(),
            "--config".to_string(),
            path.display().to_string(),
            "--total-budget-ms".to_string(),
            "4000".to_string(),
        ]);
        let config = args.governance_config().unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.admission.global_limit, 8);
        assert_eq!(config.budget.total_ms, 4000);
    }
}
