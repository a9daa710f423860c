//! Embedding generation for dense retrieval.
//!
//! Provides embedding generation using fastembed (when available) or a
//! hash-based fallback for deterministic pseudo-embeddings.
//!
//! The dimension is fixed at build time. Indexes written with a different
//! dimension are invalidated at startup by the migration check.
//!
//! # Feature Flags
//!
//! - `fastembed-embeddings`: Enables `FastEmbed` with BGE-M3 (1024 dimensions)
//! - Without the feature: Uses hash-based fallback (deterministic but not semantic)

mod fallback;

#[cfg(feature = "fastembed-embeddings")]
mod fastembed_impl;

pub use fallback::FallbackEmbedder;

#[cfg(feature = "fastembed-embeddings")]
pub use fastembed_impl::FastEmbedEmbedder;

use crate::Result;

/// Embedding dimensions for the BGE-M3 model.
///
/// This is the authoritative source for embedding dimensions across the
/// codebase. The index schema and the migration check both use it.
pub const EMBEDDING_DIM: usize = 1024;

/// Trait for embedding generators.
///
/// Implementations must be thread-safe (`Send + Sync`); CPU-bound model
/// calls are dispatched through `spawn_blocking` by the embedding cache.
///
/// # Examples
///
/// ```
/// use carrel::embedding::{Embedder, FallbackEmbedder, EMBEDDING_DIM};
///
/// let embedder = FallbackEmbedder::new(EMBEDDING_DIM);
/// let embedding = embedder.embed("Hello, world!").unwrap();
/// assert_eq!(embedding.len(), EMBEDDING_DIM);
/// ```
pub trait Embedder: Send + Sync {
    /// Returns the embedding dimensions.
    fn dimensions(&self) -> usize;

    /// Generates an embedding for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generates embeddings for multiple texts.
    ///
    /// The default implementation calls `embed` for each text sequentially.
    /// Implementations may override this for batch optimization.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails for any text.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Creates the default embedder based on available features.
///
/// # Errors
///
/// Returns an error if embedder initialization fails.
#[cfg(feature = "fastembed-embeddings")]
pub fn create_embedder() -> Result<std::sync::Arc<dyn Embedder>> {
    Ok(std::sync::Arc::new(FastEmbedEmbedder::new()?))
}

/// Creates the default embedder based on available features.
///
/// # Errors
///
/// Returns an error if embedder initialization fails (never fails for fallback).
#[cfg(not(feature = "fastembed-embeddings"))]
pub fn create_embedder() -> Result<std::sync::Arc<dyn Embedder>> {
    Ok(std::sync::Arc::new(FallbackEmbedder::new(EMBEDDING_DIM)))
}

/// Computes cosine similarity between two embedding vectors.
///
/// Returns a value between -1.0 (opposite) and 1.0 (identical); 0.0 for
/// mismatched lengths or zero-magnitude vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}
