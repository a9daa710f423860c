//! Context compressor.
//!
//! Fits ranked chunks into the LLM token budget. Whole chunks are included
//! by descending confidence while the 85% soft bound holds, then one chunk
//! may be truncated to fill the remainder. The emitted text restores the
//! original ordering and keeps the original `[i]` citation numbers so the
//! answer's references stay valid.

use tracing::debug;

/// Soft bound: whole chunks stop being added at this fraction of the budget.
const SOFT_BOUND: f64 = 0.85;
/// A truncated filler chunk is only added below this fraction.
const FILL_BOUND: f64 = 0.70;

/// Token-budget context assembler.
#[derive(Debug, Clone, Copy)]
pub struct ContextCompressor {
    max_chars: usize,
    chars_per_token: usize,
}

impl ContextCompressor {
    /// Creates a compressor with a token budget.
    #[must_use]
    pub const fn new(max_tokens: usize, chars_per_token: usize) -> Self {
        Self {
            max_chars: max_tokens * chars_per_token,
            chars_per_token,
        }
    }

    /// Estimates the token count of a text.
    #[must_use]
    pub const fn estimate_tokens(&self, text: &str) -> usize {
        text.len() / self.chars_per_token
    }

    /// Compresses chunks to fit the budget.
    ///
    /// Returns the assembled context and the original character count.
    /// Citation numbers `[i]` reflect each chunk's position in the input
    /// ranking, dropped chunks are reported in a trailing note.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn compress(&self, chunks: &[String], confidences: Option<&[f32]>) -> (String, usize) {
        if chunks.is_empty() {
            return (String::new(), 0);
        }

        let original_chars: usize = chunks.iter().map(String::len).sum();

        // Under budget: emit everything in order
        if original_chars <= self.max_chars {
            let context = chunks
                .iter()
                .enumerate()
                .map(|(i, chunk)| format!("[{}] {}", i + 1, chunk))
                .collect::<Vec<_>>()
                .join("\n\n");
            return (context, original_chars);
        }

        // Order by confidence descending (stable on ties via input order)
        let mut indexed: Vec<(usize, &String, f32)> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let conf = confidences
                    .and_then(|c| c.get(i))
                    .copied()
                    .unwrap_or(1.0);
                (i, chunk, conf)
            })
            .collect();
        indexed.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let soft_limit = (self.max_chars as f64 * SOFT_BOUND) as usize;
        let fill_limit = (self.max_chars as f64 * FILL_BOUND) as usize;

        let mut selected: Vec<(usize, String)> = Vec::new();
        let mut total_chars = 0usize;

        for (orig_idx, chunk, _conf) in indexed {
            if total_chars + chunk.len() <= soft_limit {
                selected.push((orig_idx, chunk.clone()));
                total_chars += chunk.len();
            } else if total_chars < fill_limit {
                // One truncated chunk fills the remaining budget
                let remaining = soft_limit.saturating_sub(total_chars);
                let end = crate::chunking::semantic::floor_char_boundary(chunk, remaining);
                let truncated = format!("{}...", &chunk[..end]);
                total_chars += truncated.len();
                selected.push((orig_idx, truncated));
                break;
            } else {
                break;
            }
        }

        // Restore original ordering so the context reads coherently
        selected.sort_by_key(|(idx, _)| *idx);

        let mut context = selected
            .iter()
            .map(|(idx, chunk)| format!("[{}] {}", idx + 1, chunk))
            .collect::<Vec<_>>()
            .join("\n\n");

        let dropped = chunks.len() - selected.len();
        if dropped > 0 {
            context.push_str(&format!(
                "\n\n[Note: {dropped} additional sources available but omitted for brevity]"
            ));
        }

        debug!(
            original_chars,
            compressed_chars = context.len(),
            kept = selected.len(),
            total = chunks.len(),
            "context compressed"
        );

        (context, original_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor() -> ContextCompressor {
        ContextCompressor::new(100, 4) // 400-char budget
    }

    #[test]
    fn test_under_budget_keeps_everything() {
        let chunks = vec!["alpha".to_string(), "beta".to_string()];
        let (context, original) = compressor().compress(&chunks, None);
        assert_eq!(original, 9);
        assert!(context.contains("[1] alpha"));
        assert!(context.contains("[2] beta"));
        assert!(!context.contains("omitted"));
    }

    #[test]
    fn test_over_budget_drops_low_confidence() {
        let chunks = vec![
            "a".repeat(200),
            "b".repeat(200),
            "c".repeat(200),
        ];
        let confidences = vec![0.9, 0.2, 0.8];
        let (context, _) = compressor().compress(&chunks, Some(&confidences));

        // Low-confidence middle chunk should be the casualty
        assert!(context.contains(&"a".repeat(200)));
        assert!(context.contains("omitted"));
    }

    #[test]
    fn test_original_order_and_numbering_preserved() {
        let chunks = vec!["a".repeat(150), "b".repeat(150), "c".repeat(150)];
        let confidences = vec![0.1, 0.9, 0.8];
        let (context, _) = compressor().compress(&chunks, Some(&confidences));

        // Chunks b (index 1) and c (index 2) survive; numbering reflects
        // original ranking and order is restored
        let pos_2 = context.find("[2]");
        let pos_3 = context.find("[3]");
        assert!(pos_2.is_some() && pos_3.is_some());
        assert!(pos_2 < pos_3);
    }

    #[test]
    fn test_truncated_filler() {
        // First chunk fits whole; the second is truncated into the
        // remaining 15% of the budget
        let chunks = vec!["a".repeat(200), "b".repeat(300)];
        let (context, _) = compressor().compress(&chunks, Some(&[0.9, 0.8]));
        assert!(context.contains("..."));
        assert!(context.len() <= 450);
    }

    #[test]
    fn test_empty_input() {
        let (context, original) = compressor().compress(&[], None);
        assert!(context.is_empty());
        assert_eq!(original, 0);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(compressor().estimate_tokens("12345678"), 2);
    }
}
