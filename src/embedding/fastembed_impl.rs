//! `FastEmbed`-based semantic embedder.
//!
//! Provides real semantic embeddings using the BGE-M3 model via fastembed-rs.
//! Only available when the `fastembed-embeddings` feature is enabled.

use crate::Result;
use crate::embedding::{EMBEDDING_DIM, Embedder};
use crate::error::DependencyError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::OnceLock;

/// Thread-safe singleton for the embedding model, lazily initialized on
/// first use to preserve cold start time.
static EMBEDDING_MODEL: OnceLock<std::sync::Mutex<fastembed::TextEmbedding>> = OnceLock::new();

/// `FastEmbed` embedder using BGE-M3 (1024 dimensions).
pub struct FastEmbedEmbedder {
    /// Model name for diagnostics.
    model_name: &'static str,
}

impl FastEmbedEmbedder {
    /// Creates a new `FastEmbed` embedder.
    ///
    /// The model itself is loaded lazily on the first `embed()` call.
    ///
    /// # Errors
    ///
    /// Returns an error if embedder construction fails.
    #[allow(clippy::missing_const_for_fn)]
    pub fn new() -> Result<Self> {
        Ok(Self {
            model_name: "bge-m3",
        })
    }

    /// Gets or initializes the embedding model (thread-safe).
    fn get_model() -> Result<&'static std::sync::Mutex<fastembed::TextEmbedding>> {
        if let Some(model) = EMBEDDING_MODEL.get() {
            return Ok(model);
        }

        let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::BGEM3)
            .with_show_download_progress(false);

        let model = fastembed::TextEmbedding::try_new(options).map_err(|e| {
            DependencyError::Unavailable {
                name: "embedding".to_string(),
                reason: format!("failed to load embedding model: {e}"),
            }
        })?;

        let _ = EMBEDDING_MODEL.set(std::sync::Mutex::new(model));

        EMBEDDING_MODEL.get().ok_or_else(|| {
            DependencyError::Unavailable {
                name: "embedding".to_string(),
                reason: "model initialization race".to_string(),
            }
            .into()
        })
    }

    /// Returns the model name.
    #[must_use]
    pub const fn model_name(&self) -> &'static str {
        self.model_name
    }

    fn run_model(texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let model = Self::get_model()?;
        let mut model = model.lock().map_err(|e| DependencyError::Unavailable {
            name: "embedding".to_string(),
            reason: format!("model lock poisoned: {e}"),
        })?;

        // ONNX runtime can panic on malformed inputs; contain it
        let result = catch_unwind(AssertUnwindSafe(|| model.embed(texts.to_vec(), None)));

        result
            .map_err(|panic_info| {
                let msg = panic_info
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic_info.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                crate::Error::Dependency(DependencyError::Misbehaving {
                    name: "embedding".to_string(),
                    reason: format!("ONNX runtime panic: {msg}"),
                })
            })?
            .map_err(|e| {
                crate::Error::Dependency(DependencyError::Misbehaving {
                    name: "embedding".to_string(),
                    reason: format!("embedding failed: {e}"),
                })
            })
    }
}

impl Embedder for FastEmbedEmbedder {
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(crate::Error::InvalidInput {
                message: "cannot embed empty text".to_string(),
            });
        }

        Self::run_model(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DependencyError::Misbehaving {
                    name: "embedding".to_string(),
                    reason: "no embedding returned from model".to_string(),
                }
                .into()
            })
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        if texts.iter().any(|t| t.is_empty()) {
            return Err(crate::Error::InvalidInput {
                message: "cannot embed empty text".to_string(),
            });
        }

        Self::run_model(texts)
    }
}
