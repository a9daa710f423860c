//! Stuck-work recovery.
//!
//! Sources can be left in `processing` by a crash mid-ingest. On startup
//! and every five minutes, sources stuck past the threshold are reconciled:
//! if the index already holds their chunks they are marked completed with
//! the observed count, if content is present they are re-ingested, and
//! otherwise they are marked failed. Status converges even across crashes.

use crate::config::CoreConfig;
use crate::core::SourceStatus;
use crate::index::HybridIndex;
use crate::ingest::IngestService;
use crate::store::SourceStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Action taken for one recovered source.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAction {
    /// Source that was reconciled.
    pub source_id: String,
    /// What happened: `marked_completed`, `re_ingested`, or `marked_failed`.
    pub action: String,
    /// Chunk count observed or produced.
    pub chunks: usize,
}

/// Summary of one recovery sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Sources found stuck.
    pub stuck_found: usize,
    /// Sources successfully reconciled.
    pub recovered: usize,
    /// Sources that could not be reconciled.
    pub failed: usize,
    /// Per-source details.
    pub actions: Vec<RecoveryAction>,
}

/// Periodic reconciler for sources stuck in `processing`.
pub struct StuckSourceRecovery {
    config: CoreConfig,
    sources: Arc<SourceStore>,
    index: Arc<HybridIndex>,
    ingest: Arc<IngestService>,
    running: AtomicBool,
}

impl StuckSourceRecovery {
    /// Creates the recovery service.
    #[must_use]
    pub fn new(
        config: CoreConfig,
        sources: Arc<SourceStore>,
        index: Arc<HybridIndex>,
        ingest: Arc<IngestService>,
    ) -> Self {
        Self {
            config,
            sources,
            index,
            ingest,
            running: AtomicBool::new(false),
        }
    }

    /// One sweep: reconcile every stuck source, then garbage-collect
    /// orphan index rows whose source no longer exists.
    pub async fn check_and_recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let threshold = Utc::now()
            - chrono::Duration::from_std(self.config.stuck_threshold)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let all_sources = self.sources.list_all().await;

        // Integrity sweep: index rows with no parent source are orphans
        let mut notebooks: Vec<String> = Vec::new();
        for source in &all_sources {
            if !notebooks.contains(&source.notebook_id) {
                notebooks.push(source.notebook_id.clone());
            }
        }
        for notebook_id in &notebooks {
            let valid: Vec<String> = all_sources
                .iter()
                .filter(|s| &s.notebook_id == notebook_id)
                .map(|s| s.id.clone())
                .collect();
            if let Err(e) = self.index.sweep_orphans(notebook_id, &valid).await {
                warn!(notebook_id, error = %e, "orphan sweep failed");
            }
        }

        // Collect stuck sources across all notebooks
        let all: Vec<crate::core::Source> = all_sources
            .into_iter()
            .filter(|s| s.status == SourceStatus::Processing && s.updated_at < threshold)
            .collect();

        for source in all {
            report.stuck_found += 1;
            match self.recover_one(&source).await {
                Ok(action) => {
                    info!(source_id = %source.id, action = %action.action, "source recovered");
                    report.recovered += 1;
                    report.actions.push(action);
                }
                Err(e) => {
                    warn!(source_id = %source.id, error = %e, "recovery failed");
                    report.failed += 1;
                }
            }
        }

        if report.stuck_found > 0 {
            info!(
                stuck = report.stuck_found,
                recovered = report.recovered,
                failed = report.failed,
                "stuck-source sweep"
            );
        }
        report
    }

    async fn recover_one(&self, source: &crate::core::Source) -> crate::Result<RecoveryAction> {
        // Chunks already present: the ingest finished but the status write
        // was lost. Adopt the observed count.
        let chunks_in_index = self
            .index
            .count_chunks(&source.notebook_id, &source.id)
            .await?;
        if chunks_in_index > 0 {
            self.sources
                .set_status(&source.id, SourceStatus::Completed, Some(chunks_in_index), None)
                .await;
            return Ok(RecoveryAction {
                source_id: source.id.clone(),
                action: "marked_completed".to_string(),
                chunks: chunks_in_index,
            });
        }

        // Content available: run the ingest again.
        if !source.content.trim().is_empty() {
            let report = self
                .ingest
                .ingest(
                    &source.notebook_id,
                    &source.id,
                    &source.content,
                    &source.title,
                    source.kind,
                )
                .await?;
            return Ok(RecoveryAction {
                source_id: source.id.clone(),
                action: "re_ingested".to_string(),
                chunks: report.chunks,
            });
        }

        // Nothing to work with.
        self.sources
            .set_status(&source.id, SourceStatus::Failed, None, Some("no content"))
            .await;
        Ok(RecoveryAction {
            source_id: source.id.clone(),
            action: "marked_failed".to_string(),
            chunks: 0,
        })
    }

    /// Runs the periodic loop until [`Self::stop`] is called. Performs an
    /// immediate sweep first (the startup check).
    pub async fn run_loop(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            interval_secs = self.config.recovery_interval.as_secs(),
            "stuck-source recovery loop started"
        );

        while self.running.load(Ordering::SeqCst) {
            self.check_and_recover().await;
            tokio::time::sleep(self.config.recovery_interval).await;
        }
    }

    /// Stops the loop after its current sleep.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddingCache;
    use crate::core::{Source, SourceKind};
    use crate::embedding::{EMBEDDING_DIM, Embedder, FallbackEmbedder};
    use crate::graph::{EntityGraph, EntityStore};
    use crate::store::NotebookStore;

    async fn fixture() -> (CoreConfig, Arc<SourceStore>, Arc<HybridIndex>, Arc<IngestService>) {
        let config = CoreConfig::new("/tmp/unused");
        let index = Arc::new(HybridIndex::in_memory(EMBEDDING_DIM).unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(FallbackEmbedder::new(EMBEDDING_DIM));
        let sources = Arc::new(SourceStore::new(None));
        let notebooks = Arc::new(NotebookStore::new(None));
        notebooks.create("nb", "Test").await.unwrap();
        let ingest = Arc::new(IngestService::new(
            config.clone(),
            Arc::clone(&index),
            embedder,
            Arc::new(EmbeddingCache::new(100, None)),
            Arc::new(EntityStore::new(None)),
            Arc::new(EntityGraph::new(None)),
            Arc::clone(&sources),
            notebooks,
            None,
            None,
        ));
        (config, sources, index, ingest)
    }

    async fn stuck_source(sources: &SourceStore, id: &str, content: &str) {
        let mut source = Source::new(id, "nb", format!("{id}.txt").as_str(), SourceKind::Note);
        source.status = SourceStatus::Processing;
        source.content = content.to_string();
        source.updated_at = Utc::now() - chrono::Duration::minutes(30);
        sources.put(source).await;
    }

    #[tokio::test]
    async fn test_stuck_with_content_reingested() {
        let (config, sources, index, ingest) = fixture().await;
        stuck_source(&sources, "s1", "Recoverable content for the index.").await;

        let recovery = StuckSourceRecovery::new(config, Arc::clone(&sources), index, ingest);
        let report = recovery.check_and_recover().await;

        assert_eq!(report.stuck_found, 1);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.actions[0].action, "re_ingested");
        assert_eq!(
            sources.get("s1").await.unwrap().status,
            SourceStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_stuck_without_content_fails() {
        let (config, sources, index, ingest) = fixture().await;
        stuck_source(&sources, "s1", "").await;

        let recovery = StuckSourceRecovery::new(config, Arc::clone(&sources), index, ingest);
        let report = recovery.check_and_recover().await;

        assert_eq!(report.actions[0].action, "marked_failed");
        let source = sources.get("s1").await.unwrap();
        assert_eq!(source.status, SourceStatus::Failed);
        assert_eq!(source.error.as_deref(), Some("no content"));
    }

    #[tokio::test]
    async fn test_stuck_with_indexed_chunks_marked_completed() {
        let (config, sources, index, ingest) = fixture().await;
        stuck_source(&sources, "s1", "content").await;

        // Chunks already landed before the crash
        let embedder = FallbackEmbedder::new(EMBEDDING_DIM);
        index
            .upsert("nb", &[crate::core::ChunkRecord {
                chunk_id: "s1_c0".to_string(),
                source_id: "s1".to_string(),
                notebook_id: "nb".to_string(),
                text: "content".to_string(),
                level: crate::core::ChunkLevel::Paragraph,
                parent_id: Some("s1_doc".to_string()),
                section_title: String::new(),
                position: 0,
                filename: "s1.txt".to_string(),
                parent_text: None,
                vector: embedder.embed("content").unwrap(),
            }])
            .await
            .unwrap();

        let recovery = StuckSourceRecovery::new(config, Arc::clone(&sources), index, ingest);
        let report = recovery.check_and_recover().await;

        assert_eq!(report.actions[0].action, "marked_completed");
        let source = sources.get("s1").await.unwrap();
        assert_eq!(source.status, SourceStatus::Completed);
        assert_eq!(source.chunk_count, 1);
    }

    #[tokio::test]
    async fn test_orphan_rows_swept() {
        let (config, sources, index, ingest) = fixture().await;
        // A healthy source so the notebook is visible to the sweep
        let mut source = Source::new("s_ok", "nb", "ok.txt", SourceKind::Note);
        source.status = SourceStatus::Completed;
        sources.put(source).await;

        // An index row whose parent source no longer exists
        let embedder = FallbackEmbedder::new(EMBEDDING_DIM);
        index
            .upsert("nb", &[crate::core::ChunkRecord {
                chunk_id: "ghost_c0".to_string(),
                source_id: "ghost".to_string(),
                notebook_id: "nb".to_string(),
                text: "orphaned row".to_string(),
                level: crate::core::ChunkLevel::Paragraph,
                parent_id: Some("ghost_doc".to_string()),
                section_title: String::new(),
                position: 0,
                filename: "ghost.txt".to_string(),
                parent_text: None,
                vector: embedder.embed("orphaned row").unwrap(),
            }])
            .await
            .unwrap();

        let recovery =
            StuckSourceRecovery::new(config, Arc::clone(&sources), Arc::clone(&index), ingest);
        recovery.check_and_recover().await;

        assert_eq!(index.count_chunks("nb", "ghost").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fresh_processing_source_untouched() {
        let (config, sources, index, ingest) = fixture().await;
        let mut source = Source::new("s1", "nb", "s1.txt", SourceKind::Note);
        source.status = SourceStatus::Processing;
        sources.put(source).await;

        let recovery = StuckSourceRecovery::new(config, Arc::clone(&sources), index, ingest);
        let report = recovery.check_and_recover().await;
        assert_eq!(report.stuck_found, 0);
        assert_eq!(
            sources.get("s1").await.unwrap().status,
            SourceStatus::Processing
        );
    }
}
