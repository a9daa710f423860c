//! Adaptive retrieval engine.
//!
//! One attempt runs: expansion -> cached embedding -> parallel dense +
//! lexical search -> reciprocal-rank fusion -> entity / temporal / routing /
//! tag boosts -> rerank -> source-diversity interleave -> quality gate.
//! A failed gate triggers corrective retrieval with query variants (up to
//! two extra attempts, best kept by max confidence); residual low
//! confidence engages the web fallback. The engine never raises - every
//! path produces a [`RetrievalOutcome`].

use crate::cache::{ContextCompressor, EmbeddingCache};
use crate::config::CoreConfig;
use crate::core::{Citation, ChunkRecord, SourceKind};
use crate::embedding::Embedder;
use crate::graph::EntityStore;
use crate::index::HybridIndex;
use crate::metrics::{QueryTracker, Stage};
use crate::query::analyzer::{
    self, QueryAnalysis, expand_query, fallback_query_analysis, generate_query_variants,
    interleave_by_source, verify_retrieval_quality,
};
use crate::query::router::{self, RoutingDecision};
use crate::store::SourceStore;
use crate::web::{WebContext, WebFallback};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// RRF constant (`score = sum 1/(60 + rank)`).
const RRF_K: f64 = 60.0;
/// Cap on the additive entity boost.
const ENTITY_BOOST_CAP: f32 = 0.3;
/// Per-entity text-match boost.
const ENTITY_TEXT_BOOST: f32 = 0.15;
/// Per-pattern temporal boost.
const TEMPORAL_BOOST: f32 = 0.05;
/// Cap on the additive temporal boost.
const TEMPORAL_BOOST_CAP: f32 = 0.2;
/// Tag-match boost.
const TAG_BOOST: f32 = 0.1;
/// Base confidence for chunks found only by the lexical layer.
const LEXICAL_BASE_CONFIDENCE: f32 = 0.4;
/// Maximum corrective attempts beyond the first.
const MAX_CORRECTIVE_ATTEMPTS: usize = 2;

/// A chunk with fusion, boost, and rerank scores.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    /// The underlying index row.
    pub record: ChunkRecord,
    /// Reciprocal-rank fusion score.
    pub rrf_score: f64,
    /// Cosine similarity when the dense layer returned this chunk.
    pub dense_score: Option<f32>,
    /// BM25 score when the lexical layer returned this chunk.
    pub lexical_score: Option<f32>,
    /// Accumulated additive boost.
    pub boost: f32,
    /// Final per-result confidence in `[0, 1]`, set by the reranker.
    pub confidence: f32,
}

/// Reranker contract. A cross-encoder implementation can be plugged in;
/// the default orders by boosted base scores.
pub trait Reranker: Send + Sync {
    /// Assigns `confidence` to each chunk and sorts descending.
    fn rerank(&self, query: &str, chunks: &mut [RankedChunk]);
}

/// Fallback reranker: confidence from the dense similarity (or a fixed
/// lexical base) plus boosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreOrderReranker;

impl Reranker for ScoreOrderReranker {
    fn rerank(&self, _query: &str, chunks: &mut [RankedChunk]) {
        for chunk in chunks.iter_mut() {
            let dense_base = chunk.dense_score.map_or(0.0, |s| s.max(0.0));
            let lexical_base = if chunk.lexical_score.is_some() {
                LEXICAL_BASE_CONFIDENCE
            } else {
                0.0
            };
            chunk.confidence = (dense_base.max(lexical_base) + chunk.boost).clamp(0.0, 1.0);
        }
        chunks.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

/// Result of the full retrieval pipeline.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    /// Final ranked chunks (diversity-interleaved, truncated to top-k).
    pub chunks: Vec<RankedChunk>,
    /// 1-based citations matching the chunks.
    pub citations: Vec<Citation>,
    /// Compressed, numbered context for the LLM.
    pub context: String,
    /// Best per-result confidence.
    pub max_confidence: f32,
    /// Mean per-result confidence.
    pub avg_confidence: f32,
    /// Strategies attempted, in order.
    pub strategies_tried: Vec<String>,
    /// Whether corrective retrieval ran.
    pub corrective_triggered: bool,
    /// Whether the final attempt passed the quality gate.
    pub quality_ok: bool,
    /// Gate reason (pass or fail).
    pub quality_reason: String,
    /// Web context when the fallback engaged.
    pub web: Option<WebContext>,
    /// Whether a dependency failure degraded this retrieval.
    pub degraded: bool,
}

struct Attempt {
    chunks: Vec<RankedChunk>,
    max_confidence: f32,
    avg_confidence: f32,
    quality_ok: bool,
    quality_reason: String,
    degraded: bool,
}

/// Per-source metadata prefetched for boosting.
struct SourceMeta {
    kind: SourceKind,
    tags: Vec<String>,
}

/// The adaptive retrieval engine. Dependencies are passed in explicitly;
/// tests build fresh engines over in-memory stores.
pub struct RetrievalEngine {
    config: CoreConfig,
    index: Arc<HybridIndex>,
    embedder: Arc<dyn Embedder>,
    embedding_cache: Arc<EmbeddingCache>,
    entities: Arc<EntityStore>,
    sources: Arc<SourceStore>,
    reranker: Arc<dyn Reranker>,
    compressor: ContextCompressor,
    web: Option<Arc<WebFallback>>,
}

impl RetrievalEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new(
        config: CoreConfig,
        index: Arc<HybridIndex>,
        embedder: Arc<dyn Embedder>,
        embedding_cache: Arc<EmbeddingCache>,
        entities: Arc<EntityStore>,
        sources: Arc<SourceStore>,
        reranker: Arc<dyn Reranker>,
        web: Option<Arc<WebFallback>>,
    ) -> Self {
        let compressor =
            ContextCompressor::new(config.max_context_tokens, config.chars_per_token);
        Self {
            config,
            index,
            embedder,
            embedding_cache,
            entities,
            sources,
            reranker,
            compressor,
            web,
        }
    }

    /// Runs the full adaptive retrieval pipeline for a question.
    pub async fn retrieve(
        &self,
        notebook_id: &str,
        question: &str,
        tracker: &mut QueryTracker,
    ) -> RetrievalOutcome {
        tracker.start_stage();
        let analysis = fallback_query_analysis(question);
        let expanded = expand_query(question);
        let routing = router::route(question);
        let temporal_patterns = analyzer::extract_temporal_filter(question)
            .map(|f| f.patterns())
            .unwrap_or_default();
        tracker.end_stage(Stage::QueryAnalysis);

        // Boost inputs shared across attempts
        let query_entities = self.entities.find_in_query(notebook_id, question).await;
        let entity_names: Vec<String> = query_entities
            .iter()
            .map(|e| e.name.to_lowercase())
            .collect();
        let source_boosts = self.entities.source_boosts(notebook_id, question).await;
        let notebook_tags = self.sources.notebook_tags(notebook_id).await;
        let question_lower = question.to_lowercase();
        let matching_tags: Vec<&String> = notebook_tags
            .iter()
            .filter(|tag| question_lower.contains(tag.as_str()))
            .collect();

        let mut strategies_tried = Vec::new();
        let mut corrective_triggered = false;
        let mut best: Option<Attempt> = None;

        // Attempt queue: expanded query first, then corrective variants
        let mut attempt_queries = vec![expanded];
        let mut variant_pool: Vec<String> = Vec::new();

        let mut attempt_index = 0;
        while attempt_index < attempt_queries.len() {
            let attempt_query = attempt_queries[attempt_index].clone();
            let strategy = if attempt_index == 0 {
                "hybrid".to_string()
            } else {
                corrective_triggered = true;
                tracker.record_corrective();
                format!("corrective_{attempt_index}")
            };
            strategies_tried.push(strategy.clone());
            tracker.record_strategy(&strategy);

            let corrective_start = Instant::now();
            let attempt = self
                .run_attempt(
                    notebook_id,
                    &attempt_query,
                    &analysis,
                    &routing,
                    &entity_names,
                    &source_boosts,
                    &matching_tags,
                    &temporal_patterns,
                    tracker,
                )
                .await;
            if attempt_index > 0 {
                #[allow(clippy::cast_precision_loss)]
                tracker.record_stage_ms(
                    Stage::CorrectiveRetrieval,
                    corrective_start.elapsed().as_secs_f64() * 1000.0,
                );
            }

            let quality_ok = attempt.quality_ok;
            let better = best
                .as_ref()
                .is_none_or(|b| attempt.max_confidence > b.max_confidence);
            if better {
                best = Some(attempt);
            }

            if quality_ok {
                break;
            }

            // Gate failed: queue corrective variants (once)
            if variant_pool.is_empty() && attempt_index == 0 {
                variant_pool = generate_query_variants(question)
                    .into_iter()
                    .filter(|v| !attempt_queries.contains(v))
                    .take(MAX_CORRECTIVE_ATTEMPTS)
                    .collect();
                attempt_queries.extend(variant_pool.clone());
            }

            attempt_index += 1;
        }

        let best = best.unwrap_or_else(|| Attempt {
            chunks: Vec::new(),
            max_confidence: 0.0,
            avg_confidence: 0.0,
            quality_ok: false,
            quality_reason: "No results retrieved".to_string(),
            degraded: false,
        });

        tracker.record_quality_check(best.quality_ok, &best.quality_reason);
        tracker.record_retrieval(
            best.chunks.len(),
            best.chunks.len().min(self.config.top_k),
            best.max_confidence,
            best.avg_confidence,
        );

        self.finish(notebook_id, question, best, strategies_tried, corrective_triggered, tracker)
            .await
    }

    /// One search attempt: fan-out, fuse, boost, rerank, diversify, gate.
    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        notebook_id: &str,
        attempt_query: &str,
        analysis: &QueryAnalysis,
        routing: &RoutingDecision,
        entity_names: &[String],
        source_boosts: &HashMap<String, f32>,
        matching_tags: &[&String],
        temporal_patterns: &[String],
        tracker: &mut QueryTracker,
    ) -> Attempt {
        let k1 = self.config.top_k * 3;
        let mut degraded = false;

        // Embed through the cache (records the hit for metrics)
        let embedding_cached = self.embedding_cache.get(attempt_query).await.is_some();
        tracker.start_stage();
        let query_vector = match self
            .embedding_cache
            .embed_with(&self.embedder, attempt_query, self.config.embed_timeout)
            .await
        {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(error = %e, "query embedding failed, lexical-only attempt");
                degraded = true;
                None
            }
        };
        tracker.end_stage(Stage::Embedding);
        if embedding_cached {
            tracker.record_cache(false, true);
        }

        // Fan out dense and lexical searches in parallel
        let dense_future = async {
            let start = Instant::now();
            let hits = match &query_vector {
                Some(vector) => self
                    .index
                    .search_dense(notebook_id, vector, k1)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "dense search failed");
                        Vec::new()
                    }),
                None => Vec::new(),
            };
            (hits, start.elapsed())
        };
        let lexical_future = async {
            let start = Instant::now();
            let hits = self
                .index
                .search_lexical(notebook_id, attempt_query, k1)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "lexical search failed");
                    Vec::new()
                });
            (hits, start.elapsed())
        };
        let ((dense_hits, dense_elapsed), (lexical_hits, lexical_elapsed)) =
            tokio::join!(dense_future, lexical_future);
        tracker.record_stage_ms(Stage::DenseSearch, dense_elapsed.as_secs_f64() * 1000.0);
        tracker.record_stage_ms(Stage::LexicalSearch, lexical_elapsed.as_secs_f64() * 1000.0);

        // Reciprocal-rank fusion, deduplicated by chunk id
        tracker.start_stage();
        let mut fused: HashMap<String, RankedChunk> = HashMap::new();
        for (rank, hit) in dense_hits.into_iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let rrf = 1.0 / (RRF_K + rank as f64 + 1.0);
            fused
                .entry(hit.record.chunk_id.clone())
                .and_modify(|c| {
                    c.rrf_score += rrf;
                    c.dense_score = Some(hit.score);
                })
                .or_insert(RankedChunk {
                    record: hit.record,
                    rrf_score: rrf,
                    dense_score: Some(hit.score),
                    lexical_score: None,
                    boost: 0.0,
                    confidence: 0.0,
                });
        }
        for (rank, hit) in lexical_hits.into_iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let rrf = 1.0 / (RRF_K + rank as f64 + 1.0);
            fused
                .entry(hit.record.chunk_id.clone())
                .and_modify(|c| {
                    c.rrf_score += rrf;
                    c.lexical_score = Some(hit.score);
                })
                .or_insert(RankedChunk {
                    record: hit.record,
                    rrf_score: rrf,
                    dense_score: None,
                    lexical_score: Some(hit.score),
                    boost: 0.0,
                    confidence: 0.0,
                });
        }
        let mut chunks: Vec<RankedChunk> = fused.into_values().collect();
        chunks.sort_by(|a, b| {
            b.rrf_score
                .partial_cmp(&a.rrf_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chunks.truncate(k1);

        // Prefetch per-source metadata for routing and tag boosts
        let mut source_meta: HashMap<String, SourceMeta> = HashMap::new();
        for chunk in &chunks {
            if !source_meta.contains_key(&chunk.record.source_id)
                && let Some(source) = self.sources.get(&chunk.record.source_id).await
            {
                source_meta.insert(chunk.record.source_id.clone(), SourceMeta {
                    kind: source.kind,
                    tags: source.tags,
                });
            }
        }

        // Boosts, each capped
        for chunk in &mut chunks {
            let text_lower = chunk.record.text.to_lowercase();

            // Entity boost
            let source_boost = source_boosts
                .get(&chunk.record.source_id)
                .copied()
                .unwrap_or(0.0);
            #[allow(clippy::cast_precision_loss)]
            let text_matches = entity_names
                .iter()
                .filter(|name| text_lower.contains(name.as_str()))
                .count() as f32;
            let entity_boost = ENTITY_TEXT_BOOST
                .mul_add(text_matches, source_boost * ENTITY_TEXT_BOOST)
                .min(ENTITY_BOOST_CAP);

            // Temporal boost over text, filename, and source id
            let searchable = format!(
                "{} {} {}",
                text_lower,
                chunk.record.filename.to_lowercase(),
                chunk.record.source_id.to_lowercase()
            );
            #[allow(clippy::cast_precision_loss)]
            let temporal_matches = temporal_patterns
                .iter()
                .filter(|p| searchable.contains(p.as_str()))
                .count() as f32;
            let temporal_boost = (temporal_matches * TEMPORAL_BOOST).min(TEMPORAL_BOOST_CAP);

            // Source-type routing boost (bias only)
            let meta = source_meta.get(&chunk.record.source_id);
            let routing_boost = meta.map_or(0.0, |m| routing.boost_for(m.kind));

            // Tag boost
            let tag_boost = meta.map_or(0.0, |m| {
                if matching_tags.iter().any(|t| m.tags.contains(*t)) {
                    TAG_BOOST
                } else {
                    0.0
                }
            });

            chunk.boost = entity_boost + temporal_boost + routing_boost + tag_boost;
        }
        tracker.end_stage(Stage::Fusion);

        // Rerank, then enforce source diversity, then cut to top-k
        tracker.start_stage();
        self.reranker.rerank(attempt_query, &mut chunks);
        tracker.end_stage(Stage::Rerank);

        let mut chunks = interleave_by_source(chunks, |c| c.record.source_id.clone());
        chunks.truncate(self.config.top_k);

        let max_confidence = chunks.iter().map(|c| c.confidence).fold(0.0f32, f32::max);
        #[allow(clippy::cast_precision_loss)]
        let avg_confidence = if chunks.is_empty() {
            0.0
        } else {
            chunks.iter().map(|c| c.confidence).sum::<f32>() / chunks.len() as f32
        };

        tracker.start_stage();
        let texts: Vec<&str> = chunks.iter().map(|c| c.record.text.as_str()).collect();
        let (quality_ok, quality_reason) = verify_retrieval_quality(&texts, analysis);
        tracker.end_stage(Stage::QualityCheck);

        debug!(
            attempt_query,
            chunks = chunks.len(),
            max_confidence,
            quality_ok,
            "retrieval attempt"
        );

        Attempt {
            chunks,
            max_confidence,
            avg_confidence,
            quality_ok,
            quality_reason,
            degraded,
        }
    }

    /// Builds citations and compressed context; engages the web fallback
    /// when confidence is too low.
    async fn finish(
        &self,
        _notebook_id: &str,
        question: &str,
        best: Attempt,
        strategies_tried: Vec<String>,
        corrective_triggered: bool,
        tracker: &mut QueryTracker,
    ) -> RetrievalOutcome {
        let citations: Vec<Citation> = best
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| Citation::new(i + 1, &chunk.record.source_id, &chunk.record.text))
            .collect();

        // Web fallback on low confidence or empty citations
        let mut web = None;
        if WebFallback::should_engage(best.max_confidence, citations.len())
            && let Some(fallback) = &self.web
        {
            tracker.start_stage();
            let context = fallback.gather_context(question).await;
            tracker.end_stage(Stage::WebFallback);
            if !context.sources.is_empty() {
                web = Some(context);
            }
        }

        // Context: parent-expanded text where available, compressed to the
        // token budget with original citation numbers preserved
        tracker.start_stage();
        let texts: Vec<String> = best
            .chunks
            .iter()
            .map(|c| {
                c.record
                    .parent_text
                    .clone()
                    .unwrap_or_else(|| c.record.text.clone())
            })
            .collect();
        let confidences: Vec<f32> = best.chunks.iter().map(|c| c.confidence).collect();
        let (context, _original_chars) = self.compressor.compress(&texts, Some(&confidences));
        tracker.end_stage(Stage::ContextBuild);

        RetrievalOutcome {
            chunks: best.chunks,
            citations,
            context,
            max_confidence: best.max_confidence,
            avg_confidence: best.avg_confidence,
            strategies_tried,
            corrective_triggered,
            quality_ok: best.quality_ok,
            quality_reason: best.quality_reason,
            web,
            degraded: best.degraded,
        }
    }
}
