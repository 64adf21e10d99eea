/// Trait for pluggable cost estimators.
///
/// An estimate is a cheap stand-in for the real analysis cost of a text. It
/// must be deterministic, linear in the input length, and return at least 1
/// for any non-empty text.
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;

    /// Human-readable name for logging / metrics.
    fn name(&self) -> &'static str;
}

fn is_hangul_syllable(c: char) -> bool {
    ('\u{AC00}'..='\u{D7A3}').contains(&c)
}

// ---------------------------------------------------------------------------
// HangulWeighted: Hangul syllables carry more morphemes than other characters
// ---------------------------------------------------------------------------

/// Weights are tenths of a cost unit; the total is rounded up.
pub struct HangulWeighted {
    pub hangul_tenths: usize,
    pub other_tenths: usize,
}

impl Default for HangulWeighted {
    fn default() -> Self {
        // 1.5 units per syllable, 0.8 per anything else
        Self {
            hangul_tenths: 15,
            other_tenths: 8,
        }
    }
}

impl CostEstimator for HangulWeighted {
    fn estimate(&self, text: &str) -> usize {
        let mut tenths = 0usize;
        for c in text.chars() {
            tenths += if is_hangul_syllable(c) {
                self.hangul_tenths
            } else {
                self.other_tenths
            };
        }
        tenths.div_ceil(10)
    }

    fn name(&self) -> &'static str {
        "hangul_weighted"
    }
}

// ---------------------------------------------------------------------------
// CharCount: one unit per character
// ---------------------------------------------------------------------------

pub struct CharCount;

impl CostEstimator for CharCount {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count()
    }

    fn name(&self) -> &'static str {
        "char_count"
    }
}

/// Parse an estimator name into a boxed estimator.
pub fn parse_estimator(name: &str) -> Result<Box<dyn CostEstimator>, String> {
    match name {
        "hangul_weighted" => Ok(Box::new(HangulWeighted::default())),
        "char_count" => Ok(Box::new(CharCount)),
        other => Err(format!(
            "unknown cost estimator '{}', available: hangul_weighted, char_count",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hangul_weighted() {
        let est = HangulWeighted::default();
        // 2 syllables * 1.5 = 3.0
        assert_eq!(est.estimate("안녕"), 3);
        // 5 ascii * 0.8 = 4.0
        assert_eq!(est.estimate("hello"), 4);
        // 1 syllable + '.' = 1.5 + 0.8 = 2.3 -> 3
        assert_eq!(est.estimate("다."), 3);
        assert_eq!(est.estimate(""), 0);
    }

    #[test]
    fn test_non_empty_costs_at_least_one() {
        let est = HangulWeighted::default();
        assert_eq!(est.estimate("a"), 1);
        assert_eq!(est.estimate(" "), 1);
        assert_eq!(CharCount.estimate("a"), 1);
    }

    #[test]
    fn test_jamo_are_not_syllables() {
        let est = HangulWeighted::default();
        // Compatibility jamo count as "other"
        assert_eq!(est.estimate("ㅋㅋ"), 2);
    }

    #[test]
    fn test_hangul_weighs_more_than_latin() {
        let est = HangulWeighted::default();
        assert!(est.estimate("가나다라마") > est.estimate("abcde"));
    }

    #[test]
    fn test_parse_estimator() {
        assert_eq!(parse_estimator("char_count").unwrap().name(), "char_count");
        assert_eq!(
            parse_estimator("hangul_weighted").unwrap().name(),
            "hangul_weighted"
        );
        assert!(parse_estimator("mecab").is_err());
    }
}
