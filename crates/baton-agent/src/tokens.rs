use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use baton_core::config::{BudgetConfig, EstimatorKind};
use baton_core::error::{BatonError, Result};
use baton_core::types::ChatMessage;

/// Fixed per-message framing cost added on top of the content estimate.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Marker appended to content shortened at the character level.
pub const TRUNCATION_MARKER: &str = "[truncated]";

/// Maps text to an estimated token count.
///
/// Implementations must be deterministic and monotonic in the length of the
/// input: appending characters never lowers the estimate.
pub trait TokenEstimator: Send + Sync + 'static {
    fn estimate(&self, text: &str) -> usize;

    /// Estimate for a whole message, including framing overhead.
    fn estimate_message(&self, msg: &ChatMessage) -> usize {
        self.estimate(&msg.content) + MESSAGE_OVERHEAD
    }
}

/// Character-count heuristic: `ceil(chars / chars_per_token)`.
///
/// With the default of 3 characters per token this over-counts typical
/// English and source text, so budgets computed with it are not undershot.
#[derive(Debug, Clone, Copy)]
pub struct CharEstimator {
    chars_per_token: usize,
}

impl CharEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self::new(3)
    }
}

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// BPE token count using `cl100k_base`.
pub struct BpeEstimator {
    bpe: CoreBPE,
}

impl BpeEstimator {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| BatonError::Config(format!("Failed to load cl100k_base tokenizer: {}", e)))?;
        Ok(Self { bpe })
    }
}

impl TokenEstimator for BpeEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

/// Build the estimator selected in config.
pub fn estimator_from_config(config: &BudgetConfig) -> Result<Arc<dyn TokenEstimator>> {
    Ok(match config.estimator {
        EstimatorKind::Chars => Arc::new(CharEstimator::new(config.chars_per_token)),
        EstimatorKind::Bpe => Arc::new(BpeEstimator::new()?),
    })
}

/// Hard-truncate `text` so that it (with the truncation marker) fits in
/// `max_tokens`. Prefers cutting at a newline boundary.
///
/// Returns the text unchanged when it already fits, the bare marker when not
/// even an empty prefix fits, and an empty string when the marker alone is
/// over `max_tokens`.
pub fn truncate_to_tokens(estimator: &dyn TokenEstimator, text: &str, max_tokens: usize) -> String {
    if estimator.estimate(text) <= max_tokens {
        return text.to_string();
    }

    let ends: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let with_marker = |end: usize| format!("{}\n{}", &text[..end], TRUNCATION_MARKER);

    if estimator.estimate(&with_marker(0)) > max_tokens {
        if estimator.estimate(TRUNCATION_MARKER) <= max_tokens {
            return TRUNCATION_MARKER.to_string();
        }
        return String::new();
    }

    // Largest prefix (in chars) whose marked form still fits.
    let (mut lo, mut hi) = (0usize, ends.len());
    while lo + 1 < hi {
        let mid = (lo + hi) / 2;
        if estimator.estimate(&with_marker(ends[mid])) <= max_tokens {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let cut = ends[lo];
    let prefix = &text[..cut];
    match prefix.rfind('\n') {
        Some(nl) if nl >= cut / 2 => with_marker(nl),
        _ => with_marker(cut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_estimator_rounds_up() {
        let est = CharEstimator::new(3);
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.estimate("ab"), 1);
        assert_eq!(est.estimate("abc"), 1);
        assert_eq!(est.estimate("abcd"), 2);
    }

    #[test]
    fn test_char_estimator_counts_chars_not_bytes() {
        let est = CharEstimator::new(1);
        assert_eq!(est.estimate("héllo"), 5);
    }

    #[test]
    fn test_char_estimator_monotonic() {
        let est = CharEstimator::default();
        let text = "The quick brown fox jumps over the lazy dog.";
        let mut last = 0;
        for end in 0..=text.len() {
            let tokens = est.estimate(&text[..end]);
            assert!(tokens >= last);
            last = tokens;
        }
    }

    #[test]
    fn test_estimate_message_adds_overhead() {
        let est = CharEstimator::new(3);
        let msg = ChatMessage::user("abcdef");
        assert_eq!(est.estimate_message(&msg), 2 + MESSAGE_OVERHEAD);
    }

    #[test]
    fn test_bpe_estimator() {
        let est = BpeEstimator::new().unwrap();
        assert_eq!(est.estimate(""), 0);
        let text = "The quick brown fox jumps over the lazy dog.";
        let tokens = est.estimate(text);
        assert!(tokens > 0 && tokens < text.len());
    }

    #[test]
    fn test_truncate_short_text_unchanged() {
        let est = CharEstimator::new(1);
        assert_eq!(truncate_to_tokens(&est, "short", 10), "short");
    }

    #[test]
    fn test_truncate_fits_budget() {
        let est = CharEstimator::new(1);
        let text = "x".repeat(200);
        let out = truncate_to_tokens(&est, &text, 50);
        assert!(est.estimate(&out) <= 50);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert!(out.starts_with("xxx"));
    }

    #[test]
    fn test_truncate_prefers_newline() {
        let est = CharEstimator::new(1);
        let text = "line one\nline two\nline three\nline four";
        let out = truncate_to_tokens(&est, text, 30);
        assert!(est.estimate(&out) <= 30);
        assert!(out.starts_with("line one\nline two"));
        assert!(out.ends_with("\n[truncated]"));
    }

    #[test]
    fn test_truncate_budget_below_marker() {
        let est = CharEstimator::new(1);
        assert_eq!(truncate_to_tokens(&est, "abcdefghijklmnop", 11), TRUNCATION_MARKER);
        assert_eq!(truncate_to_tokens(&est, "abcdefghijklmnop", 3), "");
        assert_eq!(truncate_to_tokens(&est, "abcdefghijklmnop", 0), "");
    }

    #[test]
    fn test_truncate_multibyte_boundaries() {
        let est = CharEstimator::new(1);
        let text = "é".repeat(100);
        let out = truncate_to_tokens(&est, &text, 40);
        assert!(est.estimate(&out) <= 40);
    }
}
