//! Query orchestrator.
//!
//! Gatekeeper above the retrieval engine. Simple and moderate queries
//! delegate straight to a single retrieval + generation pass. Complex
//! queries are decomposed into sub-questions that fan out in parallel;
//! their citations are renumbered contiguously and a synthesis call
//! composes the final answer.

use crate::cache::{AnswerCache, EmbeddingCache};
use crate::config::CoreConfig;
use crate::embedding::Embedder;
use crate::graph::{CommunityDetector, EntityGraph, EntityStore, is_holistic_query};
use crate::llm::{GenerateOptions, LlmClient, ModelHint};
use crate::memory::{EventKind, EventLog};
use crate::metrics::{MetricsService, Stage};
use crate::query::analyzer::{self, QueryType};
use crate::query::decomposer;
use crate::query::retrieval::RetrievalEngine;
use crate::query::QueryResponse;
use crate::verify;
use crate::web::WebFallback;
use futures_util::future::join_all;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Confidence floor for a sub-answer to contribute to synthesis.
const SUB_ANSWER_MIN_CONFIDENCE: f32 = 0.2;

/// Query complexity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Straight question; fast path.
    Simple,
    /// Multiple entities or periods; still a single pass.
    Moderate,
    /// Decomposed and synthesized.
    Complex,
}

impl Complexity {
    /// Wire string for this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }
}

// Complexity patterns. Pattern literals, exercised by the tests below.
#[allow(clippy::unwrap_used)]
static COMPLEX_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"compare.*(?:to|with|against|and)",
        r"(?:write|create|draft).*(?:review|summary|report)",
        r"(?:analyze|evaluate|assess).*(?:performance|progress|metrics)",
        r"based on.*(?:all|multiple|different)",
        r"looking at.*(?:last|past|recent).*(?:months?|quarters?|years?)",
        r"(?:pros?\s+(?:and|&)\s+cons?|advantages?\s+(?:and|&)\s+disadvantages?)",
        r"step.by.step",
        r"(?:how|why).*(?:and|also|additionally)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
#[allow(clippy::unwrap_used)]
static MODERATE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?:q[1-4]|quarter).*(?:and|to|through).*(?:q[1-4]|quarter)",
        r"(?:both|all|each).*(?:quarters?|months?|years?)",
        r"(?:compare|difference|between)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Classifies query complexity.
#[must_use]
pub fn classify_complexity(query: &str) -> Complexity {
    let q_lower = query.to_lowercase();

    for re in COMPLEX_RES.iter() {
        if re.is_match(&q_lower) {
            return Complexity::Complex;
        }
    }
    if query.matches('?').count() > 1 || query.len() > 200 {
        return Complexity::Complex;
    }

    for re in MODERATE_RES.iter() {
        if re.is_match(&q_lower) {
            return Complexity::Moderate;
        }
    }

    Complexity::Simple
}

struct SubResult {
    question: String,
    answer: String,
    citations: Vec<crate::core::Citation>,
    confidence: f32,
}

/// Orchestrates queries over the retrieval engine and LLM.
pub struct QueryOrchestrator {
    config: CoreConfig,
    engine: Arc<RetrievalEngine>,
    llm: Arc<dyn LlmClient>,
    answer_cache: Arc<AnswerCache>,
    embedding_cache: Arc<EmbeddingCache>,
    embedder: Arc<dyn Embedder>,
    entities: Arc<EntityStore>,
    graph: Arc<EntityGraph>,
    communities: Arc<CommunityDetector>,
    metrics: Arc<MetricsService>,
    web: Option<Arc<WebFallback>>,
    event_log: Option<Arc<EventLog>>,
}

impl QueryOrchestrator {
    /// Creates the orchestrator. Dependencies are explicit so tests build
    /// fresh instances over in-memory stores.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoreConfig,
        engine: Arc<RetrievalEngine>,
        llm: Arc<dyn LlmClient>,
        answer_cache: Arc<AnswerCache>,
        embedding_cache: Arc<EmbeddingCache>,
        embedder: Arc<dyn Embedder>,
        entities: Arc<EntityStore>,
        graph: Arc<EntityGraph>,
        communities: Arc<CommunityDetector>,
        metrics: Arc<MetricsService>,
        web: Option<Arc<WebFallback>>,
        event_log: Option<Arc<EventLog>>,
    ) -> Self {
        Self {
            config,
            engine,
            llm,
            answer_cache,
            embedding_cache,
            embedder,
            entities,
            graph,
            communities,
            metrics,
            web,
            event_log,
        }
    }

    /// Main entry point: answers a question against a notebook.
    ///
    /// Never raises - failures come back as low-confidence or degraded
    /// responses.
    pub async fn query(&self, notebook_id: &str, question: &str) -> QueryResponse {
        let start = Instant::now();
        let query_type = analyzer::classify(question);
        let mut complexity = classify_complexity(question);
        if self.config.auto_upgrade_complexity && query_type == QueryType::Complex {
            complexity = Complexity::Complex;
        }

        debug!(
            notebook_id,
            query_type = query_type.as_str(),
            complexity = complexity.as_str(),
            "query received"
        );

        // Answer cache: exact first, then semantic within the notebook
        let query_embedding = self
            .embedding_cache
            .embed_with(&self.embedder, question, self.config.embed_timeout)
            .await
            .unwrap_or_default();
        if !query_embedding.is_empty()
            && let Some(hit) = self
                .answer_cache
                .get(notebook_id, question, &query_embedding)
                .await
        {
            info!(notebook_id, cache_type = ?hit.cache_type, "answer cache hit");
            let verification = verify::verify(&hit.answer, &hit.citations);
            let mut response = QueryResponse::empty(complexity);
            response.sources = distinct_sources(&hit.citations);
            response.answer = hit.answer;
            response.citations = hit.citations;
            response.low_confidence = false;
            response.cache_type = Some(hit.cache_type);
            response.similarity = Some(hit.similarity);
            response.verification = Some(verification);
            response.processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;

            let tracker = {
                let mut t = self.metrics.start_query(
                    &query_id(notebook_id, question),
                    notebook_id,
                    question,
                    query_type.as_str(),
                );
                t.record_cache(true, true);
                t.record_citations(
                    response.citations.len(),
                    response.sources.len(),
                    false,
                );
                t
            };
            self.metrics.finish_query(tracker).await;
            return response;
        }

        let mut response = if complexity == Complexity::Complex {
            self.orchestrated_query(notebook_id, question, query_type)
                .await
        } else {
            self.single_query(notebook_id, question, query_type).await
        };

        response.complexity = complexity;
        response.processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        // Cache grounded answers for reuse
        if !response.low_confidence && !query_embedding.is_empty() {
            self.answer_cache
                .put(
                    notebook_id,
                    question,
                    query_embedding,
                    &response.answer,
                    response.citations.clone(),
                )
                .await;
        }

        self.log_query_event(notebook_id, question, &response).await;
        response
    }

    /// Single-pass path: one retrieval, one generation.
    async fn single_query(
        &self,
        notebook_id: &str,
        question: &str,
        query_type: QueryType,
    ) -> QueryResponse {
        let mut tracker = self.metrics.start_query(
            &query_id(notebook_id, question),
            notebook_id,
            question,
            query_type.as_str(),
        );

        let outcome = self.engine.retrieve(notebook_id, question, &mut tracker).await;

        let mut response = QueryResponse::empty(Complexity::Simple);
        response.citations = outcome.citations.clone();
        response.sources = distinct_sources(&outcome.citations);
        response.degraded = outcome.degraded;

        // Prompt context: knowledge-graph blocks ahead of the chunk context
        let mut prompt_context = String::new();
        prompt_context.push_str(&self.entities.context_for_query(notebook_id, question, 3).await);
        let query_entities = analyzer::extract_entities(question);
        prompt_context.push_str(
            &self
                .graph
                .context_for_query(notebook_id, &query_entities, 500)
                .await,
        );
        if is_holistic_query(question) {
            prompt_context.push_str(
                &self
                    .communities
                    .context_for_query(notebook_id, &query_entities, 400)
                    .await,
            );
        }
        prompt_context.push_str(&outcome.context);

        let format_hint = analyzer::detect_format(question);
        let system = format!(
            "You are a research assistant. Answer the question using ONLY the numbered \
             sources provided. Cite every factual statement with its source number like [1]. \
             If the sources do not contain the answer, say so plainly.{format_hint}"
        );

        // Generate: the web-augmented prompt when the fallback engaged,
        // otherwise the plain grounded prompt
        tracker.start_stage();
        let answer = if let (Some(web_context), Some(web)) = (&outcome.web, &self.web) {
            match web
                .augment_answer(
                    self.llm.as_ref(),
                    question,
                    &outcome.context,
                    &web_context.context,
                    &self.generate_options(),
                )
                .await
            {
                Ok(answer) => {
                    response.web_sources = Some(web_context.sources.clone());
                    Some(answer)
                }
                Err(e) => {
                    warn!(error = %e, "web augmentation failed");
                    response.web_sources = Some(web_context.sources.clone());
                    response.web_error = Some(e.to_string());
                    None
                }
            }
        } else {
            None
        };

        let answer = match answer {
            Some(answer) => answer,
            None => {
                if outcome.citations.is_empty() && response.web_sources.is_none() {
                    // Nothing to ground on at all; say so openly
                    tracker.end_stage(Stage::LlmGeneration);
                    response.answer =
                        "I could not find information about this in your sources.".to_string();
                    response.low_confidence = true;
                    response.verification =
                        Some(verify::verify(&response.answer, &response.citations));
                    tracker.record_citations(0, 0, true);
                    self.metrics.finish_query(tracker).await;
                    return response;
                }
                let user = format!("SOURCES:\n{prompt_context}\n\nQUESTION: {question}\n\nANSWER:");
                match self.generate_with_retry(&system, &user).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!(error = %e, "generation failed");
                        tracker.record_error(Stage::LlmGeneration, &e.to_string());
                        tracker.end_stage(Stage::LlmGeneration);
                        response.answer =
                            "I was unable to generate an answer right now.".to_string();
                        response.low_confidence = true;
                        response.degraded = true;
                        tracker.record_citations(response.citations.len(), response.sources.len(), true);
                        self.metrics.finish_query(tracker).await;
                        return response;
                    }
                }
            }
        };
        tracker.end_stage(Stage::LlmGeneration);

        tracker.start_stage();
        let verification = verify::verify(&answer, &outcome.citations);
        tracker.end_stage(Stage::Verification);

        // Low local grounding stays visible even when the web filled in
        let (answer_ok, _) = analyzer::check_answer_quality(&answer, query_type);
        response.low_confidence = outcome.max_confidence < SUB_ANSWER_MIN_CONFIDENCE
            || outcome.citations.is_empty()
            || !answer_ok;
        response.answer = answer;
        response.verification = Some(verification);

        tracker.record_citations(
            response.citations.len(),
            response.sources.len(),
            response.low_confidence,
        );
        self.metrics.finish_query(tracker).await;
        response
    }

    /// Decomposition path: sub-questions fan out, citations renumber,
    /// synthesis composes the final answer.
    async fn orchestrated_query(
        &self,
        notebook_id: &str,
        question: &str,
        query_type: QueryType,
    ) -> QueryResponse {
        let sub_questions = decomposer::decompose(self.llm.as_ref(), question).await;
        if sub_questions.len() <= 1 {
            // Decomposition declined; fall back to the single pass
            return self.single_query(notebook_id, question, query_type).await;
        }

        info!(count = sub_questions.len(), "orchestrating sub-queries");

        // Fan out in parallel (bounded by the decomposer's sub-query cap)
        let futures = sub_questions.iter().map(|sub_q| {
            let sub_q = sub_q.clone();
            async move {
                let mut tracker = self.metrics.start_query(
                    &query_id(notebook_id, &sub_q),
                    notebook_id,
                    &sub_q,
                    "sub_query",
                );
                let outcome = self.engine.retrieve(notebook_id, &sub_q, &mut tracker).await;

                let answer = if outcome.citations.is_empty() {
                    String::new()
                } else {
                    let system = "You are a research assistant. Answer concisely using ONLY \
                                  the numbered sources provided. Cite with [1], [2], etc.";
                    let user = format!(
                        "SOURCES:\n{}\n\nQUESTION: {sub_q}\n\nANSWER:",
                        outcome.context
                    );
                    self.generate_with_retry(system, &user)
                        .await
                        .unwrap_or_default()
                };

                tracker.record_citations(
                    outcome.citations.len(),
                    distinct_sources(&outcome.citations).len(),
                    outcome.max_confidence < SUB_ANSWER_MIN_CONFIDENCE,
                );
                self.metrics.finish_query(tracker).await;

                SubResult {
                    question: sub_q,
                    answer,
                    citations: outcome.citations,
                    confidence: outcome.max_confidence,
                }
            }
        });
        let sub_results: Vec<SubResult> = join_all(futures).await;

        // Merge: renumber citations contiguously and rewrite sub-answers
        let mut all_citations = Vec::new();
        let mut findings = Vec::new();
        for (i, sub) in sub_results.iter().enumerate() {
            if sub.answer.is_empty() || sub.confidence < SUB_ANSWER_MIN_CONFIDENCE {
                continue;
            }

            let mut mapping: HashMap<usize, usize> = HashMap::new();
            for citation in &sub.citations {
                let new_number = all_citations.len() + 1;
                mapping.insert(citation.number, new_number);
                let mut renumbered = citation.clone();
                renumbered.number = new_number;
                all_citations.push(renumbered);
            }
            let rewritten = renumber_citations(&sub.answer, &mapping);
            findings.push(format!("Finding {}: {rewritten}", i + 1));
        }

        let sub_query_texts: Vec<String> =
            sub_results.iter().map(|s| s.question.clone()).collect();

        if findings.is_empty() {
            // No sub-answer reached the confidence floor
            let mut response = QueryResponse::empty(Complexity::Complex);
            response.answer = format!(
                "I couldn't find enough information to answer this question. \
                 I looked into: {}",
                sub_query_texts.join("; ")
            );
            response.orchestrated = true;
            response.sub_queries = Some(sub_query_texts);
            return response;
        }

        let context = findings.join("\n\n");
        let system = "You synthesize research findings into a single comprehensive answer. \
                      Keep the existing [k] citation numbers exactly as they appear in the findings.";
        let user = format!(
            "Based on these findings, answer the original question.\n\n\
             ORIGINAL QUESTION: {question}\n\nFINDINGS:\n{context}\n\n\
             Provide a comprehensive answer that synthesizes all the findings. \
             Use the [k] markers already present to cite sources.\n\nANSWER:"
        );

        let answer = match self.generate_with_retry(system, &user).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "synthesis failed, concatenating findings");
                context.clone()
            }
        };

        let verification = verify::verify(&answer, &all_citations);
        let mut response = QueryResponse::empty(Complexity::Complex);
        response.sources = distinct_sources(&all_citations);
        response.low_confidence = all_citations.len() < 2;
        response.answer = answer;
        response.citations = all_citations;
        response.orchestrated = true;
        response.sub_queries = Some(sub_query_texts);
        response.verification = Some(verification);
        response
    }

    fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            temperature: 0.3,
            max_tokens: 1000,
            model_hint: ModelHint::Main,
            timeout: self.config.llm_timeout,
        }
    }

    /// One retry with a halved budget on dependency failure, per the
    /// degradation policy.
    async fn generate_with_retry(&self, system: &str, user: &str) -> crate::Result<String> {
        let opts = self.generate_options();
        match self.llm.generate(system, user, &opts).await {
            Ok(answer) => Ok(answer),
            Err(first_err) => {
                debug!(error = %first_err, "generation failed, retrying with shorter budget");
                let retry_opts = GenerateOptions {
                    timeout: opts.timeout / 2,
                    ..opts
                };
                self.llm.generate(system, user, &retry_opts).await
            }
        }
    }

    async fn log_query_event(&self, notebook_id: &str, question: &str, response: &QueryResponse) {
        if let Some(log) = &self.event_log {
            let mut data = HashMap::new();
            data.insert(
                "question".to_string(),
                serde_json::Value::String(question.chars().take(500).collect()),
            );
            data.insert(
                "answer_preview".to_string(),
                serde_json::Value::String(response.answer.chars().take(500).collect()),
            );
            data.insert(
                "sources_used".to_string(),
                serde_json::json!(response.sources),
            );
            if let Err(e) = log.log(EventKind::ChatQa, notebook_id, None, data).await {
                warn!(error = %e, "query event log append failed");
            }
        }
    }
}

fn query_id(notebook_id: &str, question: &str) -> String {
    let key = crate::cache::cache_key(&format!("{notebook_id}:{question}"));
    key.chars().take(12).collect()
}

fn distinct_sources(citations: &[crate::core::Citation]) -> Vec<String> {
    let mut sources = Vec::new();
    for citation in citations {
        if !sources.contains(&citation.source_id) {
            sources.push(citation.source_id.clone());
        }
    }
    sources
}

/// Rewrites `[old]` markers to their new numbers in one pass, so chained
/// renumbering can never cascade.
fn renumber_citations(answer: &str, mapping: &HashMap<usize, usize>) -> String {
    #[allow(clippy::unwrap_used)]
    static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[(\d+)\]").unwrap());

    MARKER_RE
        .replace_all(answer, |caps: &regex::Captures<'_>| {
            caps.get(1)
                .and_then(|m| m.as_str().parse::<usize>().ok())
                .and_then(|old| mapping.get(&old))
                .map_or_else(|| caps[0].to_string(), |new| format!("[{new}]"))
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("How many demos did Chris run?", Complexity::Simple)]
    #[test_case("Compare the 2024 revenue of product A and product B.", Complexity::Complex)]
    #[test_case("Draft a quarterly review report", Complexity::Complex)]
    #[test_case("What changed between Q1 and the next phase?", Complexity::Moderate)]
    fn test_classify_complexity(query: &str, expected: Complexity) {
        assert_eq!(classify_complexity(query), expected);
    }

    #[test]
    fn test_multiple_questions_complex() {
        assert_eq!(
            classify_complexity("What happened? Why did it happen?"),
            Complexity::Complex
        );
    }

    #[test]
    fn test_long_query_complex() {
        let long = "x".repeat(201);
        assert_eq!(classify_complexity(&long), Complexity::Complex);
    }

    #[test]
    fn test_renumber_citations_no_cascade() {
        let mapping: HashMap<usize, usize> = [(1, 2), (2, 3)].into_iter().collect();
        // A naive sequential replace would turn [1] -> [2] -> [3]
        assert_eq!(
            renumber_citations("See [1] and [2].", &mapping),
            "See [2] and [3]."
        );
    }

    #[test]
    fn test_renumber_unknown_marker_untouched() {
        let mapping: HashMap<usize, usize> = [(1, 5)].into_iter().collect();
        assert_eq!(
            renumber_citations("See [1] and [9].", &mapping),
            "See [5] and [9]."
        );
    }

    #[test]
    fn test_distinct_sources_ordered() {
        let citations = vec![
            crate::core::Citation::new(1, "s1", "a"),
            crate::core::Citation::new(2, "s2", "b"),
            crate::core::Citation::new(3, "s1", "c"),
        ];
        assert_eq!(distinct_sources(&citations), vec!["s1", "s2"]);
    }
}
