//! Core configuration.
//!
//! A single `CoreConfig` value is built once at startup and shared by every
//! service constructor. Tests build fresh configs pointed at temp dirs.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default target chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap carried from the tail of one chunk into the next.
pub const DEFAULT_OVERLAP: usize = 100;

/// Default number of results a query ultimately targets.
pub const DEFAULT_TOP_K: usize = 8;

/// Default maximum parallel jobs in the job queue.
pub const MAX_CONCURRENT_JOBS: usize = 3;

/// Core configuration shared by all services.
///
/// # Examples
///
/// ```
/// use carrel::config::CoreConfig;
///
/// let config = CoreConfig::new("/tmp/carrel-data")
///     .with_chunk_size(800)
///     .with_top_k(5);
/// assert_eq!(config.chunk_size, 800);
/// ```
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Root data directory (index, caches, event log, version file).
    pub data_dir: PathBuf,
    /// Target chunk size in characters.
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in characters.
    pub chunk_overlap: usize,
    /// Number of results a query targets after reranking.
    pub top_k: usize,
    /// Token budget for LLM context assembly.
    pub max_context_tokens: usize,
    /// Approximate characters per token for budget math.
    pub chars_per_token: usize,
    /// Embedding cache capacity (entries).
    pub embedding_cache_size: usize,
    /// Answer cache capacity (entries).
    pub answer_cache_size: usize,
    /// Answer cache time-to-live.
    pub answer_ttl: Duration,
    /// Cosine similarity threshold for semantic answer-cache hits.
    pub answer_similarity_threshold: f32,
    /// Maximum jobs running concurrently.
    pub max_concurrent_jobs: usize,
    /// Timeout for embedding model calls.
    pub embed_timeout: Duration,
    /// Timeout for LLM generation calls.
    pub llm_timeout: Duration,
    /// Timeout for external web search calls.
    pub search_timeout: Duration,
    /// Timeout for scraping a single URL.
    pub scrape_timeout: Duration,
    /// Sources in `processing` older than this are reconciled by recovery.
    pub stuck_threshold: Duration,
    /// Interval between stuck-work recovery sweeps.
    pub recovery_interval: Duration,
    /// Whether factual queries heuristically classified as complex are
    /// upgraded to the orchestrated path.
    pub auto_upgrade_complexity: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("carrel");
        Self::new(data_dir)
    }
}

impl CoreConfig {
    /// Creates a config rooted at the given data directory with defaults.
    #[must_use]
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_OVERLAP,
            top_k: DEFAULT_TOP_K,
            max_context_tokens: 3000,
            chars_per_token: 4,
            embedding_cache_size: 10_000,
            answer_cache_size: 500,
            answer_ttl: Duration::from_secs(24 * 3600),
            answer_similarity_threshold: 0.92,
            max_concurrent_jobs: MAX_CONCURRENT_JOBS,
            embed_timeout: Duration::from_secs(30),
            llm_timeout: Duration::from_secs(60),
            search_timeout: Duration::from_secs(10),
            scrape_timeout: Duration::from_secs(15),
            stuck_threshold: Duration::from_secs(10 * 60),
            recovery_interval: Duration::from_secs(5 * 60),
            auto_upgrade_complexity: false,
        }
    }

    /// Sets the target chunk size.
    #[must_use]
    pub const fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Sets the chunk overlap.
    #[must_use]
    pub const fn with_overlap(mut self, overlap: usize) -> Self {
        self.chunk_overlap = overlap;
        self
    }

    /// Sets the retrieval top-k target.
    #[must_use]
    pub const fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Sets the context token budget.
    #[must_use]
    pub const fn with_max_context_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    /// Sets the maximum concurrent jobs.
    #[must_use]
    pub const fn with_max_concurrent_jobs(mut self, jobs: usize) -> Self {
        self.max_concurrent_jobs = jobs;
        self
    }

    /// Enables or disables heuristic complexity auto-upgrade.
    #[must_use]
    pub const fn with_auto_upgrade(mut self, enabled: bool) -> Self {
        self.auto_upgrade_complexity = enabled;
        self
    }

    /// Path to the hybrid index database file.
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("index").join("carrel.db")
    }

    /// Path to the event log directory.
    #[must_use]
    pub fn events_dir(&self) -> PathBuf {
        self.data_dir.join("memory").join("events")
    }

    /// Path to a root-level JSON state file.
    #[must_use]
    pub fn state_file(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::new("/tmp/x");
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.chunk_overlap, DEFAULT_OVERLAP);
        assert_eq!(config.max_concurrent_jobs, MAX_CONCURRENT_JOBS);
        assert!(!config.auto_upgrade_complexity);
    }

    #[test]
    fn test_builder() {
        let config = CoreConfig::new("/tmp/x")
            .with_chunk_size(500)
            .with_overlap(50)
            .with_top_k(4)
            .with_auto_upgrade(true);
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.chunk_overlap, 50);
        assert_eq!(config.top_k, 4);
        assert!(config.auto_upgrade_complexity);
    }

    #[test]
    fn test_paths() {
        let config = CoreConfig::new("/data");
        assert!(config.index_path().ends_with("index/carrel.db"));
        assert!(config.events_dir().ends_with("memory/events"));
        assert!(config.state_file("entities.json").ends_with("entities.json"));
    }
}
