//! Semantic answer cache.
//!
//! Answers are cached under an exact key derived from the notebook id and
//! question. On an exact miss, stored query embeddings for the same
//! notebook are scanned and any entry above the cosine threshold is
//! returned as a semantic hit. Entries expire after the TTL; eviction at
//! capacity removes the oldest entry by timestamp.

use crate::cache::cache_key;
use crate::core::Citation;
use crate::embedding::cosine_similarity;
use crate::persist::{load_json_or_default, save_json_atomic};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Saves to disk every N stores.
const SAVE_EVERY: usize = 10;

/// How a cached answer was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Same notebook and identical question text.
    Exact,
    /// Embedding similarity above the configured threshold.
    Semantic,
}

/// A cache hit returned to the query path.
#[derive(Debug, Clone)]
pub struct CachedAnswer {
    /// The cached answer text.
    pub answer: String,
    /// Citations stored with the answer.
    pub citations: Vec<Citation>,
    /// Exact or semantic.
    pub cache_type: CacheType,
    /// Cosine similarity for semantic hits (1.0 for exact).
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnswerEntry {
    question_preview: String,
    notebook_id: String,
    answer: String,
    citations: Vec<Citation>,
    embedding: Vec<f32>,
    timestamp: i64,
    #[serde(default)]
    hits: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AnswerState {
    entries: HashMap<String, AnswerEntry>,
    #[serde(default)]
    total_hits: u64,
    #[serde(default)]
    total_misses: u64,
}

/// Exact + semantic answer cache with TTL and disk mirror.
pub struct AnswerCache {
    state: Mutex<AnswerState>,
    stores_since_save: Mutex<usize>,
    max_size: usize,
    similarity_threshold: f32,
    ttl: Duration,
    persist_path: Option<PathBuf>,
}

impl AnswerCache {
    /// Creates an answer cache backed by `path` (`None` for memory-only).
    #[must_use]
    pub fn new(
        max_size: usize,
        similarity_threshold: f32,
        ttl: Duration,
        persist_path: Option<PathBuf>,
    ) -> Self {
        let state: AnswerState = persist_path
            .as_deref()
            .map(load_json_or_default)
            .unwrap_or_default();
        Self {
            state: Mutex::new(state),
            stores_since_save: Mutex::new(0),
            max_size,
            similarity_threshold,
            ttl,
            persist_path,
        }
    }

    fn exact_key(notebook_id: &str, question: &str) -> String {
        cache_key(&format!("{notebook_id}:{question}"))
    }

    #[allow(clippy::cast_possible_wrap)]
    fn is_expired(&self, entry: &AnswerEntry) -> bool {
        Utc::now().timestamp() - entry.timestamp > self.ttl.as_secs() as i64
    }

    /// Looks up a cached answer for the question.
    ///
    /// Tries an exact key first, then a semantic scan over entries of the
    /// same notebook.
    pub async fn get(
        &self,
        notebook_id: &str,
        question: &str,
        query_embedding: &[f32],
    ) -> Option<CachedAnswer> {
        let mut state = self.state.lock().await;

        let exact_key = Self::exact_key(notebook_id, question);
        if let Some(entry) = state.entries.get(&exact_key)
            && !self.is_expired(entry)
        {
            let answer = entry.answer.clone();
            let citations = entry.citations.clone();
            if let Some(entry) = state.entries.get_mut(&exact_key) {
                entry.hits += 1;
            }
            state.total_hits += 1;
            debug!(notebook_id, "answer cache exact hit");
            return Some(CachedAnswer {
                answer,
                citations,
                cache_type: CacheType::Exact,
                similarity: 1.0,
            });
        }

        // Semantic scan within the notebook
        let mut best: Option<(String, f32)> = None;
        for (key, entry) in &state.entries {
            if entry.notebook_id != notebook_id || self.is_expired(entry) {
                continue;
            }
            let similarity = cosine_similarity(query_embedding, &entry.embedding);
            if similarity >= self.similarity_threshold
                && best.as_ref().is_none_or(|(_, s)| similarity > *s)
            {
                best = Some((key.clone(), similarity));
            }
        }

        if let Some((key, similarity)) = best {
            let (answer, citations) = {
                let entry = state.entries.get_mut(&key)?;
                entry.hits += 1;
                (entry.answer.clone(), entry.citations.clone())
            };
            state.total_hits += 1;
            debug!(notebook_id, similarity, "answer cache semantic hit");
            return Some(CachedAnswer {
                answer,
                citations,
                cache_type: CacheType::Semantic,
                similarity,
            });
        }

        state.total_misses += 1;
        None
    }

    /// Stores an answer with its query embedding.
    pub async fn put(
        &self,
        notebook_id: &str,
        question: &str,
        query_embedding: Vec<f32>,
        answer: &str,
        citations: Vec<Citation>,
    ) {
        let mut state = self.state.lock().await;

        while state.entries.len() >= self.max_size {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.timestamp)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    state.entries.remove(&k);
                }
                None => break,
            }
        }

        let mut preview = question.to_string();
        if preview.len() > 200 {
            let end = crate::chunking::semantic::floor_char_boundary(&preview, 200);
            preview.truncate(end);
        }

        state
            .entries
            .insert(Self::exact_key(notebook_id, question), AnswerEntry {
                question_preview: preview,
                notebook_id: notebook_id.to_string(),
                answer: answer.to_string(),
                citations,
                embedding: query_embedding,
                timestamp: Utc::now().timestamp(),
                hits: 0,
            });

        drop(state);

        let mut counter = self.stores_since_save.lock().await;
        *counter += 1;
        if *counter >= SAVE_EVERY {
            *counter = 0;
            drop(counter);
            self.flush().await;
        }
    }

    /// Flushes the cache to disk.
    pub async fn flush(&self) {
        if let Some(path) = &self.persist_path {
            let state = self.state.lock().await;
            if let Err(e) = save_json_atomic(path, &*state) {
                debug!(error = %e, "answer cache save failed");
            }
        }
    }

    /// Clears all entries.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        *state = AnswerState::default();
        drop(state);
        self.flush().await;
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
