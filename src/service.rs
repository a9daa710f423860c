//! Core assembly.
//!
//! [`Carrel`] wires every service together over one data directory. It is
//! the explicit context object: no hidden globals, so tests and the CLI
//! build fresh instances against temp dirs. External dependencies (LLM,
//! web search) are injected through the builder.

use crate::cache::{AnswerCache, EmbeddingCache};
use crate::config::CoreConfig;
use crate::core::SourceKind;
use crate::embedding::{EMBEDDING_DIM, Embedder, create_embedder};
use crate::error::Result;
use crate::graph::{CommunityDetector, EntityGraph, EntityStore};
use crate::index::HybridIndex;
use crate::ingest::{IngestReport, IngestService};
use crate::jobs::JobQueue;
use crate::llm::LlmClient;
use crate::memory::{Consolidator, EventLog, MemoryStore};
use crate::metrics::MetricsService;
use crate::migrate::{MigrationManager, MigrationPlan};
use crate::query::retrieval::{RetrievalEngine, ScoreOrderReranker};
use crate::query::{QueryOrchestrator, QueryResponse};
use crate::recovery::StuckSourceRecovery;
use crate::store::{NotebookStore, SourceStore};
use crate::web::{Scraper, SearchProvider, WebFallback};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Builder for [`Carrel`].
pub struct CarrelBuilder {
    config: CoreConfig,
    llm: Option<Arc<dyn LlmClient>>,
    embedder: Option<Arc<dyn Embedder>>,
    search: Option<(Arc<dyn SearchProvider>, Arc<dyn Scraper>)>,
}

impl CarrelBuilder {
    /// Starts a builder over the given config.
    #[must_use]
    pub const fn new(config: CoreConfig) -> Self {
        Self {
            config,
            llm: None,
            embedder: None,
            search: None,
        }
    }

    /// Injects the LLM provider.
    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Overrides the embedder (defaults to the feature-selected one).
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Injects the web search and scrape providers, enabling the web
    /// fallback.
    #[must_use]
    pub fn with_search(
        mut self,
        search: Arc<dyn SearchProvider>,
        scraper: Arc<dyn Scraper>,
    ) -> Self {
        self.search = Some((search, scraper));
        self
    }

    /// Builds the wired core, running the startup migration check.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or index cannot be opened.
    pub async fn build(self) -> Result<Carrel> {
        let config = self.config;
        std::fs::create_dir_all(&config.data_dir)?;

        let embedder = match self.embedder {
            Some(embedder) => embedder,
            None => create_embedder()?,
        };

        let index = Arc::new(HybridIndex::open(config.index_path(), EMBEDDING_DIM)?);
        let migration = MigrationManager::new(config.clone());
        let migration_plan = migration.check_and_migrate(&index).await?;

        let embedding_cache = Arc::new(EmbeddingCache::new(
            config.embedding_cache_size,
            Some(config.state_file("embedding_cache.json")),
        ));
        let answer_cache = Arc::new(AnswerCache::new(
            config.answer_cache_size,
            config.answer_similarity_threshold,
            config.answer_ttl,
            Some(config.state_file("answer_cache.json")),
        ));

        let entities = Arc::new(EntityStore::new(Some(config.state_file("entities.json"))));
        let graph = Arc::new(EntityGraph::new(Some(config.state_file("entity_graph.json"))));
        let communities = Arc::new(CommunityDetector::new(Some(
            config.state_file("communities.json"),
        )));

        let notebooks = Arc::new(NotebookStore::new(Some(config.state_file("notebooks.json"))));
        let sources = Arc::new(SourceStore::new(Some(config.state_file("sources.json"))));

        let metrics = Arc::new(MetricsService::new(
            1000,
            Some(config.state_file("rag_metrics.json")),
        ));
        let event_log = Arc::new(EventLog::new(config.events_dir())?);
        let memory = Arc::new(MemoryStore::new(Some(config.state_file("memory_store.json"))));
        let consolidator = Arc::new(Consolidator::new(
            Arc::clone(&event_log),
            Arc::clone(&memory),
        ));

        let web = self.search.map(|(search, scraper)| {
            Arc::new(WebFallback::new(
                search,
                scraper,
                config.search_timeout,
                config.scrape_timeout,
            ))
        });

        let engine = Arc::new(RetrievalEngine::new(
            config.clone(),
            Arc::clone(&index),
            Arc::clone(&embedder),
            Arc::clone(&embedding_cache),
            Arc::clone(&entities),
            Arc::clone(&sources),
            Arc::new(ScoreOrderReranker),
            web.clone(),
        ));

        let ingest = Arc::new(IngestService::new(
            config.clone(),
            Arc::clone(&index),
            Arc::clone(&embedder),
            Arc::clone(&embedding_cache),
            Arc::clone(&entities),
            Arc::clone(&graph),
            Arc::clone(&sources),
            Arc::clone(&notebooks),
            self.llm.clone(),
            Some(Arc::clone(&event_log)),
        ));

        let orchestrator = self.llm.clone().map(|llm| {
            Arc::new(QueryOrchestrator::new(
                config.clone(),
                Arc::clone(&engine),
                llm,
                Arc::clone(&answer_cache),
                Arc::clone(&embedding_cache),
                Arc::clone(&embedder),
                Arc::clone(&entities),
                Arc::clone(&graph),
                Arc::clone(&communities),
                Arc::clone(&metrics),
                web,
                Some(Arc::clone(&event_log)),
            ))
        });

        let jobs = Arc::new(JobQueue::new(config.max_concurrent_jobs));
        let recovery = Arc::new(StuckSourceRecovery::new(
            config.clone(),
            Arc::clone(&sources),
            Arc::clone(&index),
            Arc::clone(&ingest),
        ));

        info!(data_dir = %config.data_dir.display(), ?migration_plan, "carrel core opened");

        Ok(Carrel {
            config,
            notebooks,
            sources,
            index,
            entities,
            graph,
            communities,
            embedding_cache,
            answer_cache,
            ingest,
            orchestrator,
            engine,
            jobs,
            metrics,
            event_log,
            memory,
            consolidator,
            recovery,
            migration_plan,
        })
    }
}

/// The assembled core: every service wired over one data directory.
pub struct Carrel {
    /// Shared configuration.
    pub config: CoreConfig,
    /// Notebook store.
    pub notebooks: Arc<NotebookStore>,
    /// Source store.
    pub sources: Arc<SourceStore>,
    /// Hybrid index.
    pub index: Arc<HybridIndex>,
    /// Entity arena.
    pub entities: Arc<EntityStore>,
    /// Relationship graph.
    pub graph: Arc<EntityGraph>,
    /// Community detector.
    pub communities: Arc<CommunityDetector>,
    /// Embedding cache.
    pub embedding_cache: Arc<EmbeddingCache>,
    /// Answer cache.
    pub answer_cache: Arc<AnswerCache>,
    /// Ingestion service.
    pub ingest: Arc<IngestService>,
    /// Query orchestrator (present only when an LLM was injected).
    pub orchestrator: Option<Arc<QueryOrchestrator>>,
    /// Retrieval engine.
    pub engine: Arc<RetrievalEngine>,
    /// Job queue.
    pub jobs: Arc<JobQueue>,
    /// Metrics service.
    pub metrics: Arc<MetricsService>,
    /// Event log.
    pub event_log: Arc<EventLog>,
    /// Long-term memory store.
    pub memory: Arc<MemoryStore>,
    /// Memory consolidator.
    pub consolidator: Arc<Consolidator>,
    /// Stuck-work recovery.
    pub recovery: Arc<StuckSourceRecovery>,
    /// Plan applied by the startup migration check.
    pub migration_plan: MigrationPlan,
}

impl Carrel {
    /// Opens the core with defaults (feature-selected embedder, no LLM, no
    /// web fallback).
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or index cannot be opened.
    pub async fn open(config: CoreConfig) -> Result<Self> {
        CarrelBuilder::new(config).build().await
    }

    /// Starts a builder for dependency injection.
    #[must_use]
    pub const fn builder(config: CoreConfig) -> CarrelBuilder {
        CarrelBuilder::new(config)
    }

    /// Creates a notebook.
    ///
    /// # Errors
    ///
    /// Returns an error if the id already exists.
    pub async fn create_notebook(&self, id: &str, title: &str) -> Result<()> {
        self.notebooks.create(id, title).await.map(|_| ())
    }

    /// Deletes a notebook, cascading to sources, index rows, entities,
    /// relationships, and communities.
    ///
    /// # Errors
    ///
    /// Returns an error if index cleanup fails.
    pub async fn delete_notebook(&self, notebook_id: &str) -> Result<()> {
        for source in self.sources.list_for_notebook(notebook_id).await {
            self.sources.delete(&source.id).await;
        }
        self.index.drop_notebook(notebook_id).await?;
        self.entities.delete_notebook(notebook_id).await;
        self.graph.delete_notebook(notebook_id).await;
        self.communities.delete_notebook(notebook_id).await;
        self.notebooks.delete(notebook_id).await;
        Ok(())
    }

    /// Convenience ingest: create a source and ingest text in one call.
    ///
    /// # Errors
    ///
    /// Returns the ingestion error; the source is marked failed.
    pub async fn ingest_text(
        &self,
        notebook_id: &str,
        filename: &str,
        text: &str,
        kind: SourceKind,
    ) -> Result<(String, IngestReport)> {
        let source_id = self
            .ingest
            .create_source(notebook_id, filename, kind, HashMap::new())
            .await?;
        let report = self
            .ingest
            .ingest(notebook_id, &source_id, text, filename, kind)
            .await?;
        Ok((source_id, report))
    }

    /// Answers a question against a notebook.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] when no LLM provider was injected.
    pub async fn query(&self, notebook_id: &str, question: &str) -> Result<QueryResponse> {
        let orchestrator = self.orchestrator.as_ref().ok_or_else(|| crate::Error::Config {
            message: "no LLM provider configured".to_string(),
        })?;
        Ok(orchestrator.query(notebook_id, question).await)
    }

    /// Answers a question inside a conversation: same pipeline as
    /// [`Self::query`], plus recall entries for the memory consolidator.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] when no LLM provider was injected.
    pub async fn query_in_conversation(
        &self,
        notebook_id: &str,
        question: &str,
        conversation_id: &str,
    ) -> Result<QueryResponse> {
        let response = self.query(notebook_id, question).await?;
        self.memory
            .add_recall(conversation_id, &format!("Q: {question}"))
            .await;
        let preview: String = response.answer.chars().take(500).collect();
        self.memory
            .add_recall(conversation_id, &format!("A: {preview}"))
            .await;
        Ok(response)
    }

    /// Recomputes communities for a notebook.
    ///
    /// # Errors
    ///
    /// Never fails in practice; propagates detector errors.
    pub async fn rebuild_communities(&self, notebook_id: &str) -> Result<usize> {
        let communities = self.communities.detect(notebook_id, &self.graph).await?;
        Ok(communities.len())
    }

    /// Flushes every disk-mirrored cache. Call on shutdown.
    pub async fn flush(&self) {
        self.embedding_cache.flush().await;
        self.answer_cache.flush().await;
    }
}
