use regex::Regex;
use serde::Serialize;

use crate::estimator::CostEstimator;

/// Sentence-final punctuation (needs trailing space or end of text so decimals
/// survive), full-width terminators, verb endings at a line break, blank lines.
const KOREAN_SENTENCE_END: &str = r#"[.!?…]+["'”’」』)\]]*(?:\s+|$)|[。！？]+["'”’」』)\]]*\s*|[다요죠까][ \t]*\r?\n\s*|\n[ \t]*\n\s*"#;

/// Cue words that introduce or continue an explanation, by category.
const KOREAN_DISCOURSE_MARKERS: &[(&str, &[&str])] = &[
    ("example", &["예를 들어", "예컨대", "가령"]),
    ("explanation", &["다시 말해", "요약하면", "즉"]),
    ("contrast", &["그러나", "하지만", "반면에"]),
    ("sequence", &["먼저", "다음으로", "마지막으로", "결과적으로"]),
];

/// A contiguous, independently processable slice of the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextSegment {
    pub id: usize,
    /// Byte offsets of `text` within the source.
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub cost: usize,
    /// False when the segment was cut inside a sentence.
    pub is_sentence_boundary: bool,
    /// Why the segment ends where it does.
    pub context: String,
}

/// Locale-specific sentence and discourse patterns.
#[derive(Debug, Clone)]
pub struct SentenceRules {
    boundary: Regex,
    markers: Regex,
    categories: Vec<(String, &'static str)>,
}

impl SentenceRules {
    pub fn new(
        boundary_pattern: &str,
        markers: &[(&'static str, &[&str])],
    ) -> Result<Self, regex::Error> {
        let mut categories = Vec::new();
        let mut alternatives = Vec::new();
        for (category, words) in markers {
            for word in words.iter() {
                categories.push((word.to_string(), *category));
                alternatives.push(regex::escape(word));
            }
        }
        // An empty alternation would match everywhere.
        let marker_pattern = if alternatives.is_empty() {
            r"[^\s\S]".to_string()
        } else {
            alternatives.join("|")
        };
        Ok(Self {
            boundary: Regex::new(boundary_pattern)?,
            markers: Regex::new(&marker_pattern)?,
            categories,
        })
    }

    pub fn korean() -> Result<Self, regex::Error> {
        Self::new(KOREAN_SENTENCE_END, KOREAN_DISCOURSE_MARKERS)
    }

    /// Byte offsets where sentences end, ascending; the last is always `text.len()`.
    pub fn sentence_ends(&self, text: &str) -> Vec<usize> {
        let mut ends: Vec<usize> = self
            .boundary
            .find_iter(text)
            .map(|m| m.end())
            .filter(|&end| end > 0)
            .collect();
        ends.dedup();
        if ends.last() != Some(&text.len()) {
            ends.push(text.len());
        }
        ends
    }

    /// Markers whose first byte lies in `[from, to)`, as `(offset, category)`.
    /// Only whole words count, so "즉시" is not "즉".
    fn markers_in(&self, text: &str, from: usize, to: usize) -> Vec<(usize, &'static str)> {
        let mut out = Vec::new();
        for m in self.markers.find_iter(&text[from..]) {
            let pos = from + m.start();
            if pos >= to {
                break;
            }
            let before = text[..pos].chars().next_back();
            let after = text[from + m.end()..].chars().next();
            let whole_word = !before.map(char::is_alphanumeric).unwrap_or(false)
                && !after.map(char::is_alphanumeric).unwrap_or(false);
            if !whole_word {
                continue;
            }
            if let Some((_, category)) = self.categories.iter().find(|(w, _)| w == m.as_str()) {
                out.push((pos, *category));
            }
        }
        out
    }
}

/// Partitions oversized text into segments under a cost threshold.
pub struct SentenceSplitter {
    rules: SentenceRules,
    max_segments: usize,
    marker_window_chars: usize,
}

impl SentenceSplitter {
    pub fn new(rules: SentenceRules, max_segments: usize, marker_window_chars: usize) -> Self {
        Self {
            rules,
            max_segments: max_segments.max(1),
            marker_window_chars,
        }
    }

    pub fn rules(&self) -> &SentenceRules {
        &self.rules
    }

    /// Greedily packs whole sentences into segments of at most `threshold` cost.
    ///
    /// A single sentence between `threshold` and `2 * threshold` becomes its own
    /// segment; anything larger is halved at character level until it fits.
    /// Hitting `max_segments` emits the remainder as-is; callers verify the cost
    /// bound afterwards.
    pub fn split(&self, text: &str, threshold: usize, estimator: &dyn CostEstimator) -> Vec<TextSegment> {
        let threshold = threshold.max(1);
        let hard_cap = threshold.saturating_mul(2);
        let ends = self.rules.sentence_ends(text);
        let mut segments: Vec<TextSegment> = Vec::new();
        let mut cursor = 0usize;
        let mut idx = 0usize;

        loop {
            let start = skip_whitespace(text, cursor);
            if start >= text.len() {
                break;
            }
            while idx < ends.len() && ends[idx] <= start {
                idx += 1;
            }
            let id = segments.len();

            if id + 1 >= self.max_segments {
                tracing::warn!(
                    segment_count = id + 1,
                    remaining_cost = estimator.estimate(&text[start..]),
                    "text splitting safety limit reached"
                );
                segments.push(make_segment(text, id, start, text.len(), true, format!("final_segment_{id}"), estimator));
                break;
            }

            if estimator.estimate(&text[start..]) <= threshold {
                segments.push(make_segment(text, id, start, text.len(), true, format!("final_segment_{id}"), estimator));
                break;
            }

            let mut packed = None;
            let mut last_sentence_start = start;
            let mut j = idx;
            while j < ends.len() && estimator.estimate(&text[start..ends[j]]) <= threshold {
                if let Some(prev) = packed {
                    last_sentence_start = prev;
                }
                packed = Some(ends[j]);
                j += 1;
            }

            let (end, on_boundary, context) = match packed {
                Some(end) => {
                    match self.extend_for_marker(text, &ends, start, last_sentence_start, end, hard_cap, estimator) {
                        Some((extended, category)) => (extended, true, format!("discourse_{category}")),
                        None => (end, true, format!("split_segment_{id}")),
                    }
                }
                None => {
                    let sentence_end = ends.get(idx).copied().unwrap_or(text.len());
                    if estimator.estimate(&text[start..sentence_end]) <= hard_cap {
                        (sentence_end, true, format!("split_segment_{id}"))
                    } else {
                        let forced = force_split(text, start, sentence_end, threshold, estimator);
                        (forced, forced == sentence_end, format!("forced_split_{id}"))
                    }
                }
            };

            segments.push(make_segment(text, id, start, end, on_boundary, context, estimator));
            cursor = end;
        }

        tracing::debug!(
            original_len = text.len(),
            segment_count = segments.len(),
            "text split into segments"
        );
        segments
    }

    /// Moves a split point past a nearby discourse marker so a cue and the
    /// sentence it introduces stay together. Returns the new end and the
    /// marker category, or `None` when no extension applies or it would break
    /// the hard cost cap.
    #[allow(clippy::too_many_arguments)]
    fn extend_for_marker(
        &self,
        text: &str,
        ends: &[usize],
        start: usize,
        last_sentence_start: usize,
        end: usize,
        hard_cap: usize,
        estimator: &dyn CostEstimator,
    ) -> Option<(usize, &'static str)> {
        if end >= text.len() || self.marker_window_chars == 0 {
            return None;
        }
        let window_from = back_chars(text, end, self.marker_window_chars).max(last_sentence_start);
        let window_to = forward_chars(text, end, self.marker_window_chars);

        let next_end_after = |pos: usize| ends.iter().copied().find(|&e| e > pos);

        let mut best: Option<(usize, &'static str)> = None;
        for (pos, category) in self.rules.markers_in(text, window_from, window_to) {
            let candidate = if pos < end {
                // The cue closes this segment; keep the sentence that follows it.
                next_end_after(end)
            } else {
                // The cue opens the next sentence; pull that sentence in.
                next_end_after(pos)
            };
            let Some(candidate) = candidate else { continue };
            if candidate <= end || estimator.estimate(&text[start..candidate]) > hard_cap {
                continue;
            }
            if best.map(|(b, _)| candidate < b).unwrap_or(true) {
                best = Some((candidate, category));
            }
        }
        best
    }
}

fn make_segment(
    text: &str,
    id: usize,
    start: usize,
    end: usize,
    is_sentence_boundary: bool,
    context: String,
    estimator: &dyn CostEstimator,
) -> TextSegment {
    let body = text[start..end].trim_end();
    TextSegment {
        id,
        start,
        end: start + body.len(),
        text: body.to_string(),
        cost: estimator.estimate(body),
        is_sentence_boundary,
        context,
    }
}

fn skip_whitespace(text: &str, from: usize) -> usize {
    text[from..]
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, _)| from + i)
        .unwrap_or(text.len())
}

fn back_chars(text: &str, pos: usize, n: usize) -> usize {
    text[..pos]
        .char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn forward_chars(text: &str, pos: usize, n: usize) -> usize {
    text[pos..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| pos + i)
        .unwrap_or(text.len())
}

/// Halves `[start, end)` at a character boundary until its cost fits under
/// `threshold`, preferring whitespace in the lower half of each cut. Always
/// returns an offset past `start`.
fn force_split(text: &str, start: usize, end: usize, threshold: usize, estimator: &dyn CostEstimator) -> usize {
    let mut end = end;
    while estimator.estimate(&text[start..end]) > threshold {
        let offsets: Vec<usize> = text[start..end].char_indices().map(|(i, _)| start + i).collect();
        if offsets.len() <= 1 {
            break;
        }
        let mid = offsets.len() / 2;
        let quarter = (offsets.len() / 4).max(1);
        let cut = (quarter..=mid)
            .rev()
            .find(|&k| text[offsets[k]..].starts_with(char::is_whitespace))
            .unwrap_or(mid);
        end = offsets[cut];
    }
    end
}
