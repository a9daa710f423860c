//! Query metrics and health.
//!
//! Every query gets an explicit [`QueryTracker`] (no hidden globals - tests
//! instantiate fresh services) that records per-stage timings, retrieval
//! counts, confidence, strategy, and cache hits. Finished trackers land in
//! a bounded ring buffer mirrored to disk with an atomic rename after every
//! query.

use crate::persist::{load_json_or_default, save_json_atomic};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Named pipeline stages for timing and error attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Query classification and expansion.
    QueryAnalysis,
    /// Query embedding (through the cache).
    Embedding,
    /// Dense vector search.
    DenseSearch,
    /// FTS5 BM25 search.
    LexicalSearch,
    /// Reciprocal-rank fusion and boosts.
    Fusion,
    /// Reranking.
    Rerank,
    /// Context compression and prompt assembly.
    ContextBuild,
    /// Answer generation.
    LlmGeneration,
    /// Retrieval quality gate.
    QualityCheck,
    /// Corrective retrieval retries.
    CorrectiveRetrieval,
    /// Web search fallback.
    WebFallback,
    /// Citation verification.
    Verification,
}

impl Stage {
    /// Wire string for this stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueryAnalysis => "query_analysis",
            Self::Embedding => "embedding",
            Self::DenseSearch => "dense_search",
            Self::LexicalSearch => "lexical_search",
            Self::Fusion => "fusion",
            Self::Rerank => "rerank",
            Self::ContextBuild => "context_build",
            Self::LlmGeneration => "llm_generation",
            Self::QualityCheck => "quality_check",
            Self::CorrectiveRetrieval => "corrective_retrieval",
            Self::WebFallback => "web_fallback",
            Self::Verification => "verification",
        }
    }
}

/// Metrics for a single query. Append-only once finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetrics {
    /// Query identifier.
    pub query_id: String,
    /// ISO timestamp.
    pub timestamp: DateTime<Utc>,
    /// Notebook queried.
    pub notebook_id: String,
    /// First 100 chars of the question.
    pub question_preview: String,
    /// Classified query type.
    pub query_type: String,
    /// Stage name -> elapsed ms.
    #[serde(default)]
    pub timings: HashMap<String, f64>,
    /// Total latency in ms.
    #[serde(default)]
    pub total_time_ms: f64,
    /// Chunks retrieved before reranking.
    #[serde(default)]
    pub chunks_retrieved: usize,
    /// Chunks surviving reranking.
    #[serde(default)]
    pub chunks_after_rerank: usize,
    /// Citations in the response.
    #[serde(default)]
    pub citations_used: usize,
    /// Distinct sources cited.
    #[serde(default)]
    pub sources_used: usize,
    /// Best per-result confidence.
    #[serde(default)]
    pub max_confidence: f32,
    /// Mean per-result confidence.
    #[serde(default)]
    pub avg_confidence: f32,
    /// Low-confidence flag on the response.
    #[serde(default)]
    pub low_confidence: bool,
    /// Whether the retrieval quality gate passed.
    #[serde(default = "default_true")]
    pub quality_check_passed: bool,
    /// Gate failure reason, when failed.
    #[serde(default)]
    pub quality_failure_reason: String,
    /// Retrieval strategies attempted, in order.
    #[serde(default)]
    pub strategies_tried: Vec<String>,
    /// Whether corrective retrieval ran.
    #[serde(default)]
    pub corrective_retrieval_triggered: bool,
    /// Answer cache hit.
    #[serde(default)]
    pub answer_cache_hit: bool,
    /// Embedding cache hit.
    #[serde(default)]
    pub embedding_cache_hit: bool,
    /// Error message, when a stage failed.
    #[serde(default)]
    pub error: String,
    /// Stage where the error occurred.
    #[serde(default)]
    pub error_stage: String,
}

const fn default_true() -> bool {
    true
}

/// Live per-query recorder. Created by [`MetricsService::start_query`] and
/// handed back to [`MetricsService::finish_query`].
#[derive(Debug)]
pub struct QueryTracker {
    metrics: QueryMetrics,
    started: Instant,
    stage_started: Instant,
}

impl QueryTracker {
    fn new(query_id: &str, notebook_id: &str, question: &str, query_type: &str) -> Self {
        let mut preview = question.to_string();
        if preview.len() > 100 {
            let end = crate::chunking::semantic::floor_char_boundary(&preview, 100);
            preview.truncate(end);
        }
        let now = Instant::now();
        Self {
            metrics: QueryMetrics {
                query_id: query_id.to_string(),
                timestamp: Utc::now(),
                notebook_id: notebook_id.to_string(),
                question_preview: preview,
                query_type: query_type.to_string(),
                timings: HashMap::new(),
                total_time_ms: 0.0,
                chunks_retrieved: 0,
                chunks_after_rerank: 0,
                citations_used: 0,
                sources_used: 0,
                max_confidence: 0.0,
                avg_confidence: 0.0,
                low_confidence: false,
                quality_check_passed: true,
                quality_failure_reason: String::new(),
                strategies_tried: Vec::new(),
                corrective_retrieval_triggered: false,
                answer_cache_hit: false,
                embedding_cache_hit: false,
                error: String::new(),
                error_stage: String::new(),
            },
            started: now,
            stage_started: now,
        }
    }

    /// Marks the start of a pipeline stage.
    pub fn start_stage(&mut self) {
        self.stage_started = Instant::now();
    }

    /// Records the elapsed time since the last `start_stage` under `stage`.
    pub fn end_stage(&mut self, stage: Stage) {
        #[allow(clippy::cast_precision_loss)]
        let elapsed_ms = self.stage_started.elapsed().as_secs_f64() * 1000.0;
        *self
            .metrics
            .timings
            .entry(stage.as_str().to_string())
            .or_insert(0.0) += elapsed_ms;
    }

    /// Records an externally measured duration for a stage.
    pub fn record_stage_ms(&mut self, stage: Stage, elapsed_ms: f64) {
        *self
            .metrics
            .timings
            .entry(stage.as_str().to_string())
            .or_insert(0.0) += elapsed_ms;
    }

    /// Records retrieval counts and confidence.
    pub fn record_retrieval(
        &mut self,
        chunks_retrieved: usize,
        chunks_after_rerank: usize,
        max_confidence: f32,
        avg_confidence: f32,
    ) {
        self.metrics.chunks_retrieved = chunks_retrieved;
        self.metrics.chunks_after_rerank = chunks_after_rerank;
        self.metrics.max_confidence = max_confidence;
        self.metrics.avg_confidence = avg_confidence;
    }

    /// Records citation counts on the final response.
    pub fn record_citations(&mut self, citations: usize, sources: usize, low_confidence: bool) {
        self.metrics.citations_used = citations;
        self.metrics.sources_used = sources;
        self.metrics.low_confidence = low_confidence;
    }

    /// Records the quality gate outcome.
    pub fn record_quality_check(&mut self, passed: bool, reason: &str) {
        self.metrics.quality_check_passed = passed;
        self.metrics.quality_failure_reason = reason.to_string();
    }

    /// Records a retrieval strategy attempt.
    pub fn record_strategy(&mut self, strategy: &str) {
        self.metrics.strategies_tried.push(strategy.to_string());
    }

    /// Flags that corrective retrieval ran.
    pub fn record_corrective(&mut self) {
        self.metrics.corrective_retrieval_triggered = true;
    }

    /// Records cache hits.
    pub const fn record_cache(&mut self, answer_hit: bool, embedding_hit: bool) {
        self.metrics.answer_cache_hit = answer_hit;
        self.metrics.embedding_cache_hit = embedding_hit;
    }

    /// Records an error with its stage.
    pub fn record_error(&mut self, stage: Stage, error: &str) {
        self.metrics.error = crate::error::Error::truncate_reason(error);
        self.metrics.error_stage = stage.as_str().to_string();
    }

    /// Current max confidence (used by retry logic).
    #[must_use]
    pub const fn max_confidence(&self) -> f32 {
        self.metrics.max_confidence
    }
}

/// Aggregated metrics over a time window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateMetrics {
    /// Queries in the window.
    pub total_queries: usize,
    /// Mean latency in ms.
    pub avg_total_time_ms: f64,
    /// Median latency.
    pub p50_total_time_ms: f64,
    /// 95th percentile latency.
    pub p95_total_time_ms: f64,
    /// 99th percentile latency.
    pub p99_total_time_ms: f64,
    /// Mean elapsed ms per stage.
    pub avg_stage_times: HashMap<String, f64>,
    /// Fraction of low-confidence responses.
    pub low_confidence_rate: f64,
    /// Fraction of quality-gate failures.
    pub quality_check_fail_rate: f64,
    /// Fraction of queries that ran corrective retrieval.
    pub corrective_retrieval_rate: f64,
    /// Mean per-result confidence.
    pub avg_confidence: f64,
    /// Mean citations per response.
    pub avg_citations: f64,
    /// Answer cache hit rate.
    pub answer_cache_hit_rate: f64,
    /// Embedding cache hit rate.
    pub embedding_cache_hit_rate: f64,
    /// Strategy name -> use count.
    pub strategy_distribution: HashMap<String, usize>,
    /// Fraction of queries with errors.
    pub error_rate: f64,
    /// Error counts by stage.
    pub errors_by_stage: HashMap<String, usize>,
}

/// Health classification derived from recent aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No issues.
    Healthy,
    /// One issue flagged.
    Degraded,
    /// Two or more issues flagged.
    Unhealthy,
}

/// Health summary for dashboards and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    /// Overall status.
    pub status: HealthStatus,
    /// Issues detected in the last hour.
    pub issues: Vec<String>,
    /// Queries in the last hour.
    pub queries_last_hour: usize,
    /// Mean latency in ms over the last hour.
    pub avg_latency_ms: f64,
    /// p95 latency in ms over the last hour.
    pub p95_latency_ms: f64,
    /// Error rate over the last hour.
    pub error_rate: f64,
    /// All-time query count.
    pub total_queries_all_time: u64,
    /// All-time error count.
    pub total_errors_all_time: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetricsState {
    queries: VecDeque<QueryMetrics>,
    #[serde(default)]
    total_queries: u64,
    #[serde(default)]
    total_errors: u64,
}

/// Metrics collection service with ring buffer and disk mirror.
pub struct MetricsService {
    state: Mutex<MetricsState>,
    max_history: usize,
    persist_path: Option<PathBuf>,
}

impl MetricsService {
    /// Creates a service backed by `path` (`None` for memory-only).
    #[must_use]
    pub fn new(max_history: usize, persist_path: Option<PathBuf>) -> Self {
        let mut state: MetricsState = persist_path
            .as_deref()
            .map(load_json_or_default)
            .unwrap_or_default();
        while state.queries.len() > max_history {
            state.queries.pop_front();
        }
        Self {
            state: Mutex::new(state),
            max_history,
            persist_path,
        }
    }

    /// Starts tracking a query.
    #[must_use]
    pub fn start_query(
        &self,
        query_id: &str,
        notebook_id: &str,
        question: &str,
        query_type: &str,
    ) -> QueryTracker {
        debug!(query_id, query_type, "metrics tracking started");
        QueryTracker::new(query_id, notebook_id, question, query_type)
    }

    /// Finishes a query: stamps total time, appends to the ring buffer, and
    /// mirrors to disk.
    pub async fn finish_query(&self, mut tracker: QueryTracker) -> QueryMetrics {
        #[allow(clippy::cast_precision_loss)]
        {
            tracker.metrics.total_time_ms = tracker.started.elapsed().as_secs_f64() * 1000.0;
        }

        let mut state = self.state.lock().await;
        state.total_queries += 1;
        if !tracker.metrics.error.is_empty() {
            state.total_errors += 1;
        }
        state.queries.push_back(tracker.metrics.clone());
        while state.queries.len() > self.max_history {
            state.queries.pop_front();
        }

        if let Some(path) = &self.persist_path
            && let Err(e) = save_json_atomic(path, &*state)
        {
            warn!(error = %e, "metrics save failed");
        }

        tracker.metrics
    }

    /// Most recent query metrics, newest last.
    pub async fn recent(&self, count: usize) -> Vec<QueryMetrics> {
        let state = self.state.lock().await;
        state
            .queries
            .iter()
            .rev()
            .take(count)
            .rev()
            .cloned()
            .collect()
    }

    /// Aggregates over the trailing window.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn aggregate(&self, hours: i64) -> AggregateMetrics {
        let cutoff = Utc::now() - ChronoDuration::hours(hours);
        let state = self.state.lock().await;
        let recent: Vec<&QueryMetrics> = state
            .queries
            .iter()
            .filter(|m| m.timestamp > cutoff)
            .collect();

        if recent.is_empty() {
            return AggregateMetrics::default();
        }

        let total = recent.len();
        let mut times: Vec<f64> = recent
            .iter()
            .map(|m| m.total_time_ms)
            .filter(|t| *t > 0.0)
            .collect();
        times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let percentile = |p: f64| -> f64 {
            if times.is_empty() {
                return 0.0;
            }
            let idx = ((times.len() as f64) * p) as usize;
            times[idx.min(times.len() - 1)]
        };

        let mut stage_totals: HashMap<String, (f64, usize)> = HashMap::new();
        for m in &recent {
            for (stage, ms) in &m.timings {
                let entry = stage_totals.entry(stage.clone()).or_insert((0.0, 0));
                entry.0 += ms;
                entry.1 += 1;
            }
        }
        let avg_stage_times = stage_totals
            .into_iter()
            .map(|(stage, (sum, count))| (stage, sum / count as f64))
            .collect();

        let mut strategy_distribution: HashMap<String, usize> = HashMap::new();
        let mut errors_by_stage: HashMap<String, usize> = HashMap::new();
        for m in &recent {
            for strategy in &m.strategies_tried {
                *strategy_distribution.entry(strategy.clone()).or_insert(0) += 1;
            }
            if !m.error.is_empty() {
                *errors_by_stage.entry(m.error_stage.clone()).or_insert(0) += 1;
            }
        }

        let rate = |pred: fn(&QueryMetrics) -> bool| -> f64 {
            recent.iter().filter(|m| pred(m)).count() as f64 / total as f64
        };

        AggregateMetrics {
            total_queries: total,
            avg_total_time_ms: if times.is_empty() {
                0.0
            } else {
                times.iter().sum::<f64>() / times.len() as f64
            },
            p50_total_time_ms: percentile(0.50),
            p95_total_time_ms: percentile(0.95),
            p99_total_time_ms: percentile(0.99),
            avg_stage_times,
            low_confidence_rate: rate(|m| m.low_confidence),
            quality_check_fail_rate: rate(|m| !m.quality_check_passed),
            corrective_retrieval_rate: rate(|m| m.corrective_retrieval_triggered),
            avg_confidence: recent.iter().map(|m| f64::from(m.avg_confidence)).sum::<f64>()
                / total as f64,
            avg_citations: recent.iter().map(|m| m.citations_used as f64).sum::<f64>()
                / total as f64,
            answer_cache_hit_rate: rate(|m| m.answer_cache_hit),
            embedding_cache_hit_rate: rate(|m| m.embedding_cache_hit),
            strategy_distribution,
            error_rate: rate(|m| !m.error.is_empty()),
            errors_by_stage,
        }
    }

    /// Derives health from the last hour's aggregates.
    pub async fn health(&self) -> HealthSummary {
        let agg = self.aggregate(1).await;

        let mut issues = Vec::new();
        if agg.error_rate > 0.05 {
            issues.push(format!("High error rate: {:.1}%", agg.error_rate * 100.0));
        }
        if agg.low_confidence_rate > 0.3 {
            issues.push(format!(
                "High low-confidence rate: {:.1}%",
                agg.low_confidence_rate * 100.0
            ));
        }
        if agg.avg_total_time_ms > 10_000.0 {
            issues.push(format!(
                "Slow queries: avg {:.1}s",
                agg.avg_total_time_ms / 1000.0
            ));
        }
        if agg.corrective_retrieval_rate > 0.3 {
            issues.push(format!(
                "High corrective retrieval rate: {:.1}%",
                agg.corrective_retrieval_rate * 100.0
            ));
        }

        let status = match issues.len() {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        };

        let state = self.state.lock().await;
        HealthSummary {
            status,
            issues,
            queries_last_hour: agg.total_queries,
            avg_latency_ms: agg.avg_total_time_ms,
            p95_latency_ms: agg.p95_total_time_ms,
            error_rate: agg.error_rate,
            total_queries_all_time: state.total_queries,
            total_errors_all_time: state.total_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MetricsService {
        MetricsService::new(100, None)
    }

    #[tokio::test]
    async fn test_tracker_records_stages() {
        let service = service();
        let mut tracker = service.start_query("q1", "nb", "question?", "factual");

        tracker.start_stage();
        tracker.end_stage(Stage::Embedding);
        tracker.start_stage();
        tracker.end_stage(Stage::DenseSearch);

        let metrics = service.finish_query(tracker).await;
        assert!(metrics.timings.contains_key("embedding"));
        assert!(metrics.timings.contains_key("dense_search"));
        assert!(metrics.total_time_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_ring_buffer_bounded() {
        let service = MetricsService::new(3, None);
        for i in 0..5 {
            let tracker = service.start_query(&format!("q{i}"), "nb", "q", "synthesis");
            service.finish_query(tracker).await;
        }
        assert_eq!(service.recent(10).await.len(), 3);
    }

    #[tokio::test]
    async fn test_aggregate_rates() {
        let service = service();

        let mut t1 = service.start_query("q1", "nb", "q", "factual");
        t1.record_citations(3, 2, false);
        t1.record_strategy("hybrid");
        service.finish_query(t1).await;

        let mut t2 = service.start_query("q2", "nb", "q", "factual");
        t2.record_citations(0, 0, true);
        t2.record_corrective();
        t2.record_error(Stage::LlmGeneration, "boom");
        service.finish_query(t2).await;

        let agg = service.aggregate(24).await;
        assert_eq!(agg.total_queries, 2);
        assert!((agg.low_confidence_rate - 0.5).abs() < f64::EPSILON);
        assert!((agg.corrective_retrieval_rate - 0.5).abs() < f64::EPSILON);
        assert!((agg.error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(agg.strategy_distribution.get("hybrid"), Some(&1));
        assert_eq!(agg.errors_by_stage.get("llm_generation"), Some(&1));
    }

    #[tokio::test]
    async fn test_health_degrades_on_errors() {
        let service = service();
        for i in 0..10 {
            let mut tracker = service.start_query(&format!("q{i}"), "nb", "q", "factual");
            if i < 2 {
                tracker.record_error(Stage::Embedding, "down");
            }
            service.finish_query(tracker).await;
        }

        let health = service.health().await;
        assert_ne!(health.status, HealthStatus::Healthy);
        assert!(!health.issues.is_empty());
        assert_eq!(health.total_queries_all_time, 10);
    }

    #[tokio::test]
    async fn test_health_healthy_when_clean() {
        let service = service();
        let mut tracker = service.start_query("q1", "nb", "q", "factual");
        tracker.record_citations(2, 1, false);
        service.finish_query(tracker).await;

        let health = service.health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_disk_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rag_metrics.json");
        {
            let service = MetricsService::new(100, Some(path.clone()));
            let tracker = service.start_query("q1", "nb", "persisted", "factual");
            service.finish_query(tracker).await;
        }
        let service = MetricsService::new(100, Some(path));
        let recent = service.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].question_preview, "persisted");
    }
}
