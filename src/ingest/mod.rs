//! Ingestion pipeline.
//!
//! Text arrives already extracted (parsing is an external concern). The
//! pipeline chunks it, embeds through the cache, upserts atomically into
//! the hybrid index, extracts entities and relationships, auto-tags, and
//! flips the source status. Failures mark the source `failed` with a
//! bounded reason and never affect other ingestions.

mod tagger;

pub use tagger::{AutoTagger, TAG_VOCABULARY};

use crate::cache::EmbeddingCache;
use crate::chunking::{MAX_PARENT_CHARS, SmartChunker, parent_context};
use crate::config::CoreConfig;
use crate::core::{ChunkRecord, Source, SourceKind, SourceStatus};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::graph::{EntityGraph, EntityStore};
use crate::index::HybridIndex;
use crate::llm::LlmClient;
use crate::memory::{EventKind, EventLog};
use crate::store::{NotebookStore, SourceStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a successful ingest.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct IngestReport {
    /// Chunks produced and indexed.
    pub chunks: usize,
    /// Characters of source text processed.
    pub characters: usize,
}

/// The ingestion service.
pub struct IngestService {
    config: CoreConfig,
    chunker: SmartChunker,
    index: Arc<HybridIndex>,
    embedder: Arc<dyn Embedder>,
    embedding_cache: Arc<EmbeddingCache>,
    entities: Arc<EntityStore>,
    graph: Arc<EntityGraph>,
    sources: Arc<SourceStore>,
    notebooks: Arc<NotebookStore>,
    tagger: AutoTagger,
    llm: Option<Arc<dyn LlmClient>>,
    event_log: Option<Arc<EventLog>>,
}

impl IngestService {
    /// Creates the service. Dependencies are explicit; tests build fresh
    /// instances over in-memory stores.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoreConfig,
        index: Arc<HybridIndex>,
        embedder: Arc<dyn Embedder>,
        embedding_cache: Arc<EmbeddingCache>,
        entities: Arc<EntityStore>,
        graph: Arc<EntityGraph>,
        sources: Arc<SourceStore>,
        notebooks: Arc<NotebookStore>,
        llm: Option<Arc<dyn LlmClient>>,
        event_log: Option<Arc<EventLog>>,
    ) -> Self {
        let chunker = SmartChunker::new(config.chunk_size, config.chunk_overlap);
        Self {
            config,
            chunker,
            index,
            embedder,
            embedding_cache,
            entities,
            graph,
            sources,
            notebooks,
            tagger: AutoTagger::new(),
            llm,
            event_log,
        }
    }

    /// Accepts a new source in `pending` status and returns its id.
    ///
    /// The metadata map may pre-specify the id under the `id` key.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInput`] for an unknown notebook.
    pub async fn create_source(
        &self,
        notebook_id: &str,
        filename: &str,
        kind: SourceKind,
        metadata: HashMap<String, Value>,
    ) -> Result<String> {
        if self.notebooks.get(notebook_id).await.is_none() {
            return Err(crate::Error::InvalidInput {
                message: format!("unknown notebook: {notebook_id}"),
            });
        }

        let source_id = metadata
            .get("id")
            .and_then(|v| v.as_str())
            .map_or_else(
                || {
                    let seed = format!(
                        "{notebook_id}:{filename}:{}",
                        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
                    );
                    let key = crate::cache::cache_key(&seed);
                    format!("src_{}", key.chars().take(12).collect::<String>())
                },
                String::from,
            );

        let mut source = Source::new(&source_id, notebook_id, filename, kind);
        source.metadata = metadata;
        if let Some(url) = source.metadata.get("url").and_then(|v| v.as_str()) {
            source.url = Some(url.to_string());
        }
        self.sources.put(source).await;

        let count = self.sources.list_for_notebook(notebook_id).await.len();
        self.notebooks.set_source_count(notebook_id, count).await;

        Ok(source_id)
    }

    /// Ingests extracted text for a source: chunk, embed, index, extract,
    /// tag, and mark completed.
    ///
    /// # Errors
    ///
    /// Returns an error after marking the source `failed` with a bounded
    /// reason. Other sources are unaffected.
    pub async fn ingest(
        &self,
        notebook_id: &str,
        source_id: &str,
        text: &str,
        filename: &str,
        kind: SourceKind,
    ) -> Result<IngestReport> {
        // Implicit creation keeps the API forgiving for re-ingestion paths
        if self.sources.get(source_id).await.is_none() {
            let mut source = Source::new(source_id, notebook_id, filename, kind);
            source.status = SourceStatus::Pending;
            self.sources.put(source).await;
        }

        self.sources
            .update(source_id, |source| {
                source.status = SourceStatus::Processing;
                source.content = text.to_string();
                source.kind = kind;
            })
            .await;

        match self
            .ingest_inner(notebook_id, source_id, text, filename, kind)
            .await
        {
            Ok(report) => {
                self.sources
                    .set_status(source_id, SourceStatus::Completed, Some(report.chunks), None)
                    .await;
                self.log_event(EventKind::SourceAccepted, notebook_id, source_id, filename)
                    .await;
                info!(notebook_id, source_id, chunks = report.chunks, "source ingested");
                Ok(report)
            }
            Err(e) => {
                let reason = e.to_string();
                self.sources
                    .set_status(source_id, SourceStatus::Failed, None, Some(&reason))
                    .await;
                warn!(notebook_id, source_id, error = %reason, "ingest failed");
                Err(e)
            }
        }
    }

    async fn ingest_inner(
        &self,
        notebook_id: &str,
        source_id: &str,
        text: &str,
        filename: &str,
        kind: SourceKind,
    ) -> Result<IngestReport> {
        if text.trim().is_empty() {
            return Err(crate::Error::InvalidInput {
                message: "empty text after extraction".to_string(),
            });
        }

        let drafts = self.chunker.chunk(text, kind, source_id, filename);
        if drafts.is_empty() {
            return Err(crate::Error::InvalidInput {
                message: "chunking produced no chunks".to_string(),
            });
        }

        // Parent context from sibling chunks, computed before embedding
        let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
        let parent_texts: Vec<String> = (0..texts.len())
            .map(|i| parent_context(&texts, i, MAX_PARENT_CHARS))
            .collect();

        let vectors = self
            .embedding_cache
            .embed_batch_with(&self.embedder, &texts, self.config.embed_timeout)
            .await?;

        let records: Vec<ChunkRecord> = drafts
            .into_iter()
            .zip(vectors)
            .zip(parent_texts)
            .map(|((draft, vector), parent_text)| ChunkRecord {
                chunk_id: draft.chunk_id,
                source_id: source_id.to_string(),
                notebook_id: notebook_id.to_string(),
                text: draft.text,
                level: draft.level,
                parent_id: draft.parent_id,
                section_title: draft.section_title,
                position: draft.position,
                filename: filename.to_string(),
                parent_text: if parent_text.is_empty() {
                    None
                } else {
                    Some(parent_text)
                },
                vector,
            })
            .collect();

        let chunk_count = self.index.upsert(notebook_id, &records).await?;

        // Knowledge graph: entities, then relationships over them
        let llm = self.llm.as_deref();
        let sample_end = crate::chunking::semantic::floor_char_boundary(text, text.len().min(8000));
        let sample = &text[..sample_end];
        let extracted = self
            .entities
            .extract_and_store(llm, sample, notebook_id, source_id)
            .await
            .unwrap_or_default();
        if extracted.len() >= 2
            && let Err(e) = self
                .graph
                .extract_relationships(llm, sample, notebook_id, source_id, &extracted)
                .await
        {
            warn!(error = %e, "relationship extraction failed");
        }

        // Auto-tags merge into any existing tags
        let generated = self.tagger.generate_tags(llm, filename, text).await;
        if !generated.is_empty() {
            self.sources
                .update(source_id, |source| {
                    for tag in &generated {
                        if !source.tags.contains(tag) {
                            source.tags.push(tag.clone());
                        }
                    }
                })
                .await;
        }

        Ok(IngestReport {
            chunks: chunk_count,
            characters: text.len(),
        })
    }

    /// Removes a source from the index, the entity arena, the graph, and
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns an error if index deletion fails; stores are still cleaned.
    pub async fn delete_source(&self, notebook_id: &str, source_id: &str) -> Result<()> {
        let index_result = self.index.delete_source(notebook_id, source_id).await;
        self.entities.delete_source(notebook_id, source_id).await;
        self.graph.delete_source(notebook_id, source_id).await;
        self.sources.delete(source_id).await;

        let count = self.sources.list_for_notebook(notebook_id).await.len();
        self.notebooks.set_source_count(notebook_id, count).await;

        index_result.map(|_| ())
    }

    /// Replaces a source's tag set (normalized).
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInput`] for an unknown source.
    pub async fn set_tags(&self, source_id: &str, tags: &[String]) -> Result<Vec<String>> {
        self.sources
            .update(source_id, |source| source.set_tags(tags.iter()))
            .await
            .map(|source| source.tags)
            .ok_or_else(|| crate::Error::InvalidInput {
                message: format!("unknown source: {source_id}"),
            })
    }

    /// Adds a single tag.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInput`] for an unknown source.
    pub async fn add_tag(&self, source_id: &str, tag: &str) -> Result<Vec<String>> {
        self.sources
            .update(source_id, |source| source.add_tag(tag))
            .await
            .map(|source| source.tags)
            .ok_or_else(|| crate::Error::InvalidInput {
                message: format!("unknown source: {source_id}"),
            })
    }

    /// Removes a tag.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInput`] for an unknown source.
    pub async fn remove_tag(&self, source_id: &str, tag: &str) -> Result<Vec<String>> {
        self.sources
            .update(source_id, |source| source.remove_tag(tag))
            .await
            .map(|source| source.tags)
            .ok_or_else(|| crate::Error::InvalidInput {
                message: format!("unknown source: {source_id}"),
            })
    }

    async fn log_event(
        &self,
        kind: EventKind,
        notebook_id: &str,
        source_id: &str,
        filename: &str,
    ) {
        if let Some(log) = &self.event_log {
            let mut data = HashMap::new();
            data.insert(
                "filename".to_string(),
                Value::String(filename.to_string()),
            );
            if let Err(e) = log.log(kind, notebook_id, Some(source_id), data).await {
                warn!(error = %e, "ingest event log append failed");
            }
        }
    }
}
