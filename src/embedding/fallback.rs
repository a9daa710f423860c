//! Hash-based fallback embedder.
//!
//! Provides deterministic pseudo-embeddings when `FastEmbed` is not
//! available. Similarity is driven by lexical overlap (word and character
//! trigram hashing), not semantics, which is enough for tests and for
//! degraded operation when the model cannot be loaded.

use crate::Result;
use crate::embedding::Embedder;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Hash-based fallback embedder.
///
/// Word-level hashing carries the primary signal; character trigrams add a
/// fuzzy-matching component. Output vectors are L2-normalized so cosine
/// similarity reduces to a dot product.
///
/// # Examples
///
/// ```
/// use carrel::embedding::{Embedder, FallbackEmbedder, EMBEDDING_DIM};
///
/// let embedder = FallbackEmbedder::new(EMBEDDING_DIM);
/// let a = embedder.embed("hello world").unwrap();
/// let b = embedder.embed("hello world").unwrap();
/// assert_eq!(a, b); // Deterministic
/// ```
pub struct FallbackEmbedder {
    dimensions: usize,
}

impl FallbackEmbedder {
    /// Creates a new fallback embedder with the specified dimensions.
    #[must_use]
    pub const fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn hash_token(token: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        hasher.finish()
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn generate(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];

        let normalized: String = text
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c.is_whitespace() {
                    c.to_ascii_lowercase()
                } else {
                    ' '
                }
            })
            .collect();

        // Word-level hashing (primary signal)
        for word in normalized.split_whitespace() {
            let hash = Self::hash_token(word);
            let idx = (hash as usize) % self.dimensions;
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            let magnitude = 1.0 + ((hash >> 16) & 0xFF) as f32 / 255.0;
            embedding[idx] += sign * magnitude;
        }

        // Character trigram hashing (secondary signal for fuzzy matching)
        let chars: Vec<char> = normalized.chars().collect();
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            let hash = Self::hash_token(&trigram);
            let idx = (hash as usize) % self.dimensions;
            let sign = if (hash >> 32) & 1 == 0 { 0.5 } else { -0.5 };
            embedding[idx] += sign;
        }

        // L2-normalize for cosine similarity
        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for val in &mut embedding {
                *val /= magnitude;
            }
        }

        embedding
    }
}

impl Embedder for FallbackEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.generate(text))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        use rayon::prelude::*;

        Ok(texts.par_iter().map(|text| self.generate(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EMBEDDING_DIM, cosine_similarity};

    #[test]
    fn test_deterministic() {
        let embedder = FallbackEmbedder::new(EMBEDDING_DIM);
        assert_eq!(
            embedder.embed("hello world").unwrap(),
            embedder.embed("hello world").unwrap()
        );
    }

    #[test]
    fn test_dimensions() {
        let embedder = FallbackEmbedder::new(EMBEDDING_DIM);
        assert_eq!(embedder.embed("test").unwrap().len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_unit_length() {
        let embedder = FallbackEmbedder::new(EMBEDDING_DIM);
        let emb = embedder.embed("hello world").unwrap();
        let magnitude: f32 = emb.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_lexical_overlap_ranks_higher() {
        let embedder = FallbackEmbedder::new(EMBEDDING_DIM);
        let base = embedder.embed("the quick brown fox").unwrap();
        let similar = embedder.embed("the quick brown dog").unwrap();
        let different = embedder.embed("completely unrelated words").unwrap();

        assert!(cosine_similarity(&base, &similar) > cosine_similarity(&base, &different));
    }

    #[test]
    fn test_batch_matches_single() {
        let embedder = FallbackEmbedder::new(EMBEDDING_DIM);
        let batch = embedder.embed_batch(&["alpha", "beta"]).unwrap();
        assert_eq!(batch[0], embedder.embed("alpha").unwrap());
        assert_eq!(batch[1], embedder.embed("beta").unwrap());
    }

    #[test]
    fn test_empty_text_zero_vector() {
        let embedder = FallbackEmbedder::new(EMBEDDING_DIM);
        let emb = embedder.embed("").unwrap();
        assert!(emb.iter().all(|&x| x == 0.0));
    }
}
