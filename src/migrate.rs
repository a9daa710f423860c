//! Version tracking and migration.
//!
//! On startup the stored `version.json` and a sample index row are
//! inspected. A matching embedding dimension needs at most an incremental
//! upgrade (rows are kept); a dimension change invalidates the index, which
//! is dropped with a prompt to re-upload sources.

use crate::config::CoreConfig;
use crate::embedding::EMBEDDING_DIM;
use crate::error::Result;
use crate::index::HybridIndex;
use crate::persist::{load_json_or_default, save_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Current core version.
pub const CURRENT_VERSION: &str = "0.7.0";

/// Embedding model name recorded in the version file.
#[cfg(feature = "fastembed-embeddings")]
pub const EMBEDDING_MODEL_NAME: &str = "bge-m3";
/// Embedding model name recorded in the version file.
#[cfg(not(feature = "fastembed-embeddings"))]
pub const EMBEDDING_MODEL_NAME: &str = "hash-fallback";

/// Contents of `version.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VersionInfo {
    /// Stored core version.
    #[serde(default)]
    pub version: String,
    /// Last update time.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Embedding model the index was built with.
    #[serde(default)]
    pub embedding_model: String,
    /// Embedding dimension the index was built with.
    #[serde(default)]
    pub embedding_dim: usize,
}

/// What the startup check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPlan {
    /// Fresh install or already current.
    None,
    /// Same dimension, older version: keep rows, new features apply to new
    /// ingests.
    Incremental,
    /// Dimension changed: the index was dropped; sources must be
    /// re-uploaded (or re-ingested from stored content).
    FullReindex,
}

/// Startup migration manager.
pub struct MigrationManager {
    config: CoreConfig,
}

impl MigrationManager {
    /// Creates the manager.
    #[must_use]
    pub const fn new(config: CoreConfig) -> Self {
        Self { config }
    }

    /// Reads the stored version info, empty when missing or corrupt.
    #[must_use]
    pub fn stored_version(&self) -> VersionInfo {
        load_json_or_default(&self.config.state_file("version.json"))
    }

    /// Writes the current version info.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_version(&self) -> Result<()> {
        let info = VersionInfo {
            version: CURRENT_VERSION.to_string(),
            updated_at: Some(Utc::now()),
            embedding_model: EMBEDDING_MODEL_NAME.to_string(),
            embedding_dim: EMBEDDING_DIM,
        };
        save_json_atomic(&self.config.state_file("version.json"), &info)
    }

    /// Inspects stored state and applies the required migration.
    ///
    /// Returns the plan that was applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be inspected or reset.
    pub async fn check_and_migrate(&self, index: &HybridIndex) -> Result<MigrationPlan> {
        let stored = self.stored_version();
        let sample_dim = index.sample_dimension().await?;

        let plan = match (stored.version.as_str(), sample_dim) {
            // Fresh install: nothing stored, nothing indexed
            ("", None) => MigrationPlan::None,
            // Dimension change always invalidates the rows
            (_, Some(dim)) if dim != EMBEDDING_DIM => MigrationPlan::FullReindex,
            ("", Some(_)) => MigrationPlan::Incremental,
            (version, _) if version != CURRENT_VERSION => {
                if stored.embedding_dim != 0 && stored.embedding_dim != EMBEDDING_DIM {
                    MigrationPlan::FullReindex
                } else {
                    MigrationPlan::Incremental
                }
            }
            _ => MigrationPlan::None,
        };

        match plan {
            MigrationPlan::None => {
                if stored.version.is_empty() {
                    self.write_version()?;
                    info!("fresh install, version recorded");
                }
            }
            MigrationPlan::Incremental => {
                info!(
                    from = %stored.version,
                    to = CURRENT_VERSION,
                    "incremental upgrade; existing rows kept"
                );
                self.write_version()?;
            }
            MigrationPlan::FullReindex => {
                warn!(
                    stored_dim = stored.embedding_dim,
                    current_dim = EMBEDDING_DIM,
                    "embedding dimension changed; dropping index, sources must be re-ingested"
                );
                index.reset().await?;
                self.write_version()?;
            }
        }

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChunkLevel, ChunkRecord};

    fn config() -> (tempfile::TempDir, CoreConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::new(dir.path());
        (dir, config)
    }

    async fn seed_row(index: &HybridIndex, dim: usize) {
        index
            .upsert("nb", &[ChunkRecord {
                chunk_id: "s1_c0".to_string(),
                source_id: "s1".to_string(),
                notebook_id: "nb".to_string(),
                text: "text".to_string(),
                level: ChunkLevel::Paragraph,
                parent_id: Some("s1_doc".to_string()),
                section_title: String::new(),
                position: 0,
                filename: "f".to_string(),
                parent_text: None,
                vector: vec![0.0; dim],
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fresh_install_records_version() {
        let (_dir, config) = config();
        let manager = MigrationManager::new(config.clone());
        let index = HybridIndex::in_memory(EMBEDDING_DIM).unwrap();

        let plan = manager.check_and_migrate(&index).await.unwrap();
        assert_eq!(plan, MigrationPlan::None);

        let stored = manager.stored_version();
        assert_eq!(stored.version, CURRENT_VERSION);
        assert_eq!(stored.embedding_dim, EMBEDDING_DIM);
    }

    #[tokio::test]
    async fn test_current_version_no_migration() {
        let (_dir, config) = config();
        let manager = MigrationManager::new(config);
        manager.write_version().unwrap();
        let index = HybridIndex::in_memory(EMBEDDING_DIM).unwrap();
        seed_row(&index, EMBEDDING_DIM).await;

        let plan = manager.check_and_migrate(&index).await.unwrap();
        assert_eq!(plan, MigrationPlan::None);
        assert_eq!(index.count_notebook_chunks("nb").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dimension_change_drops_rows() {
        let (_dir, config) = config();
        let manager = MigrationManager::new(config);
        manager.write_version().unwrap();

        // Index whose rows were built with a smaller dimension
        let index = HybridIndex::in_memory(768).unwrap();
        seed_row(&index, 768).await;

        let plan = manager.check_and_migrate(&index).await.unwrap();
        assert_eq!(plan, MigrationPlan::FullReindex);
        assert_eq!(index.count_notebook_chunks("nb").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_older_version_same_dim_incremental() {
        let (_dir, config) = config();
        let path = config.state_file("version.json");
        save_json_atomic(&path, &VersionInfo {
            version: "0.5.0".to_string(),
            updated_at: None,
            embedding_model: EMBEDDING_MODEL_NAME.to_string(),
            embedding_dim: EMBEDDING_DIM,
        })
        .unwrap();

        let manager = MigrationManager::new(config);
        let index = HybridIndex::in_memory(EMBEDDING_DIM).unwrap();
        seed_row(&index, EMBEDDING_DIM).await;

        let plan = manager.check_and_migrate(&index).await.unwrap();
        assert_eq!(plan, MigrationPlan::Incremental);
        // Rows kept
        assert_eq!(index.count_notebook_chunks("nb").await.unwrap(), 1);
        assert_eq!(manager.stored_version().version, CURRENT_VERSION);
    }
}
