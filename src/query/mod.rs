//! Query pipeline.
//!
//! The orchestrator gates on complexity, the retrieval engine produces
//! grounded chunks, and the analyzer/router/decomposer provide the pure
//! decision logic between them.

pub mod analyzer;
pub mod decomposer;
pub mod orchestrator;
pub mod retrieval;
pub mod router;

pub use analyzer::{QueryAnalysis, QueryType, TemporalFilter};
pub use orchestrator::{Complexity, QueryOrchestrator};
pub use retrieval::{RankedChunk, Reranker, RetrievalEngine, RetrievalOutcome, ScoreOrderReranker};
pub use router::{QueryIntent, RoutingDecision};

use crate::cache::CacheType;
use crate::core::{Citation, WebSource};
use crate::verify::VerificationReport;
use serde::Serialize;

/// The grounded, cited answer returned for every query.
///
/// The query path never raises: failures surface as `low_confidence`,
/// `degraded`, or `web_error` fields on this object.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    /// Answer text with inline `[k]` citations.
    pub answer: String,
    /// Citations; numbers are 1-based and dense.
    pub citations: Vec<Citation>,
    /// Distinct source ids backing the answer.
    pub sources: Vec<String>,
    /// Suggested follow-up questions.
    pub follow_up_questions: Vec<String>,
    /// True when confidence was too low to ground the answer well.
    pub low_confidence: bool,
    /// Web sources, present only when the web fallback engaged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_sources: Option<Vec<WebSource>>,
    /// Classified complexity.
    pub complexity: Complexity,
    /// Whether the decomposition path produced this answer.
    pub orchestrated: bool,
    /// End-to-end latency in milliseconds.
    pub processing_time_ms: f64,
    /// Cache hit type, when served from the answer cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_type: Option<CacheType>,
    /// Cosine similarity for semantic cache hits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    /// Citation verification report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    /// Sub-questions, present when the query was decomposed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_queries: Option<Vec<String>>,
    /// True when a dependency failure degraded the pipeline.
    pub degraded: bool,
    /// Web fallback error note, when augmentation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_error: Option<String>,
}

impl QueryResponse {
    /// An empty low-confidence response scaffold.
    #[must_use]
    pub fn empty(complexity: Complexity) -> Self {
        Self {
            answer: String::new(),
            citations: Vec::new(),
            sources: Vec::new(),
            follow_up_questions: Vec::new(),
            low_confidence: true,
            web_sources: None,
            complexity,
            orchestrated: false,
            processing_time_ms: 0.0,
            cache_type: None,
            similarity: None,
            verification: None,
            sub_queries: None,
            degraded: false,
            web_error: None,
        }
    }
}
