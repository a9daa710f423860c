//! Cache tier.
//!
//! Three caches sit between the query path and its expensive dependencies:
//!
//! - [`EmbeddingCache`] - LRU over text embeddings with a disk mirror.
//! - [`AnswerCache`] - exact and semantic (cosine >= 0.92) answer reuse.
//! - [`ContextCompressor`] - token-budget context assembly.

mod answer;
mod compress;
mod embedding;

pub use answer::{AnswerCache, CacheType, CachedAnswer};
pub use compress::ContextCompressor;
pub use embedding::{CacheStats, EmbeddingCache};

use sha2::{Digest, Sha256};

/// Hashes text into a 128-bit hex cache key.
///
/// Collision resistance is not a security requirement here; any 64-bit+
/// hash with a low collision rate suffices.
#[must_use]
pub fn cache_key(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_stable() {
        assert_eq!(cache_key("hello"), cache_key("hello"));
        assert_ne!(cache_key("hello"), cache_key("world"));
        assert_eq!(cache_key("x").len(), 32);
    }
}
