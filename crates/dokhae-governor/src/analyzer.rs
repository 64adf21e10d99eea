use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// One analyzer in the fallback chain.
///
/// The governance core only times, guards and orders stages; what a stage
/// returns is opaque to it.
#[async_trait]
pub trait AnalyzerStage: Send + Sync {
    /// Stage name; also the budget allocation key and breaker name.
    fn name(&self) -> &str;

    async fn analyze(&self, text: &str) -> anyhow::Result<Value>;
}

/// Trailing particles, longest first.
const PARTICLES: &[&str] = &[
    "에서는", "으로는", "에게서", "까지는", "에서", "에게", "으로", "까지", "부터", "처럼", "보다", "은", "는", "이", "가",
    "을", "를", "에", "의", "도", "로", "와", "과", "만",
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct Token {
    surface: String,
    stem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    particle: Option<String>,
}

/// Whitespace tokenizer with trailing-particle stripping. Always available and
/// fast; used as the last stage.
#[derive(Debug, Default, Clone)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    fn tokenize(text: &str) -> Vec<Token> {
        text.split_whitespace()
            .map(|raw| raw.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .map(|surface| {
                let split = PARTICLES.iter().find_map(|p| {
                    surface
                        .strip_suffix(p)
                        .filter(|stem| !stem.is_empty())
                        .map(|stem| (stem.to_string(), p.to_string()))
                });
                match split {
                    Some((stem, particle)) => Token {
                        surface: surface.to_string(),
                        stem,
                        particle: Some(particle),
                    },
                    None => Token {
                        surface: surface.to_string(),
                        stem: surface.to_string(),
                        particle: None,
                    },
                }
            })
            .collect()
    }
}

#[async_trait]
impl AnalyzerStage for HeuristicAnalyzer {
    fn name(&self) -> &str {
        "tertiary"
    }

    async fn analyze(&self, text: &str) -> anyhow::Result<Value> {
        let tokens = Self::tokenize(text);
        let chars = text.chars().filter(|c| !c.is_whitespace()).count();
        let hangul = text
            .chars()
            .filter(|c| ('\u{AC00}'..='\u{D7A3}').contains(c))
            .count();
        let sentences = text
            .split(|c: char| matches!(c, '.' | '!' | '?' | '。'))
            .filter(|s| !s.trim().is_empty())
            .count();

        Ok(serde_json::json!({
            "analyzer": "heuristic",
            "sentences": sentences,
            "token_count": tokens.len(),
            "hangul_ratio": if chars == 0 { 0.0 } else { hangul as f64 / chars as f64 },
            "tokens": tokens,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_particles_are_stripped() {
        let tokens = HeuristicAnalyzer::tokenize("학생들은 도서관에서 책을 읽었다.");
        let stems: Vec<&str> = tokens.iter().map(|t| t.stem.as_str()).collect();
        assert_eq!(stems, vec!["학생들", "도서관", "책", "읽었다"]);
        assert_eq!(tokens[1].particle.as_deref(), Some("에서"));
        assert_eq!(tokens[3].particle, None);
    }

    #[test]
    fn test_bare_particle_is_kept_as_stem() {
        let tokens = HeuristicAnalyzer::tokenize("이 가");
        assert_eq!(tokens[0].stem, "이");
        assert_eq!(tokens[0].particle, None);
    }

    #[tokio::test]
    async fn test_analyze_shape() {
        let value = HeuristicAnalyzer.analyze("비가 온다. 바람이 분다!").await.unwrap();
        assert_eq!(value["analyzer"], "heuristic");
        assert_eq!(value["sentences"], 2);
        assert_eq!(value["token_count"], 4);
        // 9 syllables out of 11 non-space chars
        let ratio = value["hangul_ratio"].as_f64().unwrap();
        assert!((ratio - 9.0 / 11.0).abs() < 1e-9);
        assert_eq!(value["tokens"][1]["stem"], "온다");
    }
}
