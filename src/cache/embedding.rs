//! LRU embedding cache with disk mirror.
//!
//! Keyed by a hash of the text. Concurrent calls for the same key coalesce
//! through a per-key lock; the compute callback always runs outside the map
//! lock so a slow model call cannot starve other cache users.

use crate::cache::cache_key;
use crate::embedding::Embedder;
use crate::error::{DependencyError, Result};
use crate::persist::{load_json_or_default, save_json_atomic};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Saves to disk every N cache operations.
const SAVE_EVERY: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    value: Vec<f32>,
    created_at: i64,
    #[serde(default)]
    hits: u64,
    #[serde(default)]
    last_used: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    #[serde(default)]
    total_hits: u64,
    #[serde(default)]
    total_misses: u64,
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Entries currently held.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Lifetime hits.
    pub hits: u64,
    /// Lifetime misses.
    pub misses: u64,
    /// hits / (hits + misses).
    pub hit_rate: f64,
}

struct Inner {
    state: CacheState,
    /// Monotonic recency clock for LRU eviction.
    clock: u64,
    ops_since_save: u64,
}

/// LRU cache for text embeddings with warm-start disk mirror.
pub struct EmbeddingCache {
    inner: Mutex<Inner>,
    /// Per-key locks so duplicate in-flight computes coalesce.
    pending: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    max_size: usize,
    persist_path: Option<PathBuf>,
}

impl EmbeddingCache {
    /// Creates a cache backed by `path` (pass `None` for memory-only).
    #[must_use]
    pub fn new(max_size: usize, persist_path: Option<PathBuf>) -> Self {
        let state: CacheState = persist_path
            .as_deref()
            .map(load_json_or_default)
            .unwrap_or_default();
        if !state.entries.is_empty() {
            info!(entries = state.entries.len(), "embedding cache warm-started");
        }
        Self {
            inner: Mutex::new(Inner {
                state,
                clock: 0,
                ops_since_save: 0,
            }),
            pending: Mutex::new(HashMap::new()),
            max_size,
            persist_path,
        }
    }

    /// Looks up a cached embedding without computing.
    pub async fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = cache_key(text);
        let mut inner = self.inner.lock().await;
        inner.clock += 1;
        let clock = inner.clock;
        if let Some(entry) = inner.state.entries.get_mut(&key) {
            entry.hits += 1;
            entry.last_used = clock;
            let value = entry.value.clone();
            inner.state.total_hits += 1;
            Some(value)
        } else {
            inner.state.total_misses += 1;
            None
        }
    }

    /// Inserts an embedding, evicting the least-recently-used entry at
    /// capacity.
    pub async fn put(&self, text: &str, embedding: Vec<f32>) {
        let key = cache_key(text);
        let mut inner = self.inner.lock().await;
        inner.clock += 1;
        let clock = inner.clock;
        Self::insert_locked(&mut inner, self.max_size, key, embedding, clock);
        self.maybe_save(&mut inner);
    }

    fn insert_locked(
        inner: &mut Inner,
        max_size: usize,
        key: String,
        embedding: Vec<f32>,
        clock: u64,
    ) {
        while inner.state.entries.len() >= max_size {
            let oldest = inner
                .state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    inner.state.entries.remove(&k);
                }
                None => break,
            }
        }
        inner.state.entries.insert(key, CacheEntry {
            value: embedding,
            created_at: Utc::now().timestamp(),
            hits: 0,
            last_used: clock,
        });
    }

    /// Gets an embedding from cache or computes it.
    ///
    /// Duplicate concurrent requests for the same text run the compute
    /// callback once; the rest wait on the per-key lock and read the cached
    /// result.
    ///
    /// # Errors
    ///
    /// Propagates the compute callback's error.
    pub async fn get_or_compute<F, Fut>(&self, text: &str, compute: F) -> Result<Vec<f32>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<f32>>>,
    {
        if let Some(cached) = self.get(text).await {
            return Ok(cached);
        }

        let key = cache_key(text);
        let key_lock = {
            let mut pending = self.pending.lock().await;
            pending
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = key_lock.lock().await;

        // A coalesced peer may have filled the cache while we waited
        if let Some(cached) = self.get(text).await {
            return Ok(cached);
        }

        // Compute outside the map lock
        let embedding = compute().await?;
        self.put(text, embedding.clone()).await;

        self.pending.lock().await.remove(&key);
        Ok(embedding)
    }

    /// Gets embeddings for multiple texts, computing only the uncached ones
    /// in a single batch call.
    ///
    /// # Errors
    ///
    /// Propagates the compute callback's error, or reports the dependency
    /// as misbehaving if it returns the wrong number of embeddings.
    pub async fn get_or_compute_batch<F, Fut>(
        &self,
        texts: &[String],
        compute: F,
    ) -> Result<Vec<Vec<f32>>>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<Vec<f32>>>>,
    {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut uncached_indices = Vec::new();
        let mut uncached_texts = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if let Some(cached) = self.get(text).await {
                results[i] = Some(cached);
            } else {
                uncached_indices.push(i);
                uncached_texts.push(text.clone());
            }
        }

        if !uncached_texts.is_empty() {
            let computed = compute(uncached_texts.clone()).await?;
            if computed.len() != uncached_texts.len() {
                return Err(DependencyError::Misbehaving {
                    name: "embedding".to_string(),
                    reason: format!(
                        "batch returned {} embeddings for {} texts",
                        computed.len(),
                        uncached_texts.len()
                    ),
                }
                .into());
            }

            let mut inner = self.inner.lock().await;
            for ((idx, text), embedding) in uncached_indices
                .into_iter()
                .zip(uncached_texts)
                .zip(computed)
            {
                inner.clock += 1;
                let clock = inner.clock;
                Self::insert_locked(&mut inner, self.max_size, cache_key(&text), embedding.clone(), clock);
                results[idx] = Some(embedding);
            }
            self.force_save_locked(&mut inner);
        }

        Ok(results.into_iter().flatten().collect())
    }

    /// Embeds text through the cache, dispatching the model call to a
    /// blocking thread with the given timeout budget.
    ///
    /// # Errors
    ///
    /// Returns a dependency timeout or the embedder's error.
    pub async fn embed_with(
        &self,
        embedder: &Arc<dyn Embedder>,
        text: &str,
        timeout: Duration,
    ) -> Result<Vec<f32>> {
        let text_owned = text.to_string();
        self.get_or_compute(text, || {
            let embedder = Arc::clone(embedder);
            async move {
                let handle =
                    tokio::task::spawn_blocking(move || embedder.embed(&text_owned));
                match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => Err(DependencyError::Unavailable {
                        name: "embedding".to_string(),
                        reason: join_err.to_string(),
                    }
                    .into()),
                    Err(_) => Err(DependencyError::Timeout {
                        name: "embedding".to_string(),
                        seconds: timeout.as_secs(),
                    }
                    .into()),
                }
            }
        })
        .await
    }

    /// Embeds a batch through the cache with the same dispatch rules as
    /// [`Self::embed_with`].
    ///
    /// # Errors
    ///
    /// Returns a dependency timeout or the embedder's error.
    pub async fn embed_batch_with(
        &self,
        embedder: &Arc<dyn Embedder>,
        texts: &[String],
        timeout: Duration,
    ) -> Result<Vec<Vec<f32>>> {
        self.get_or_compute_batch(texts, |uncached| {
            let embedder = Arc::clone(embedder);
            async move {
                let handle = tokio::task::spawn_blocking(move || {
                    let refs: Vec<&str> = uncached.iter().map(String::as_str).collect();
                    embedder.embed_batch(&refs)
                });
                match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => Err(DependencyError::Unavailable {
                        name: "embedding".to_string(),
                        reason: join_err.to_string(),
                    }
                    .into()),
                    Err(_) => Err(DependencyError::Timeout {
                        name: "embedding".to_string(),
                        seconds: timeout.as_secs(),
                    }
                    .into()),
                }
            }
        })
        .await
    }

    /// Returns cache statistics.
    #[allow(clippy::cast_precision_loss)]
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let total = inner.state.total_hits + inner.state.total_misses;
        let hit_rate = if total > 0 {
            inner.state.total_hits as f64 / total as f64
        } else {
            0.0
        };
        CacheStats {
            size: inner.state.entries.len(),
            max_size: self.max_size,
            hits: inner.state.total_hits,
            misses: inner.state.total_misses,
            hit_rate,
        }
    }

    /// Flushes the cache to disk.
    pub async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        self.force_save_locked(&mut inner);
    }

    /// Clears all entries.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CacheState::default();
        self.force_save_locked(&mut inner);
    }

    fn maybe_save(&self, inner: &mut Inner) {
        inner.ops_since_save += 1;
        if inner.ops_since_save >= SAVE_EVERY {
            self.force_save_locked(inner);
        }
    }

    fn force_save_locked(&self, inner: &mut Inner) {
        inner.ops_since_save = 0;
        if let Some(path) = &self.persist_path
            && let Err(e) = save_json_atomic(path, &inner.state)
        {
            debug!(error = %e, "embedding cache save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EMBEDDING_DIM, FallbackEmbedder};

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let cache = EmbeddingCache::new(10, None);
        cache.put("hello", vec![1.0, 2.0]).await;
        assert_eq!(cache.get("hello").await, Some(vec![1.0, 2.0]));
        assert_eq!(cache.get("other").await, None);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = EmbeddingCache::new(2, None);
        cache.put("a", vec![1.0]).await;
        cache.put("b", vec![2.0]).await;
        // Touch "a" so "b" becomes the LRU entry
        cache.get("a").await;
        cache.put("c", vec![3.0]).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_get_or_compute_computes_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let cache = Arc::new(EmbeddingCache::new(10, None));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("same text", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(vec![1.0, 2.0, 3.0])
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), vec![1.0, 2.0, 3.0]);
        }
        // Coalescing: the compute ran once, or at most twice under races
        assert!(calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_batch_computes_only_uncached() {
        let cache = EmbeddingCache::new(10, None);
        cache.put("a", vec![9.0]).await;

        let texts = vec!["a".to_string(), "b".to_string()];
        let result = cache
            .get_or_compute_batch(&texts, |uncached| async move {
                assert_eq!(uncached, vec!["b".to_string()]);
                Ok(vec![vec![5.0]])
            })
            .await
            .unwrap();

        assert_eq!(result, vec![vec![9.0], vec![5.0]]);
    }

    #[tokio::test]
    async fn test_batch_length_mismatch_is_error() {
        let cache = EmbeddingCache::new(10, None);
        let texts = vec!["a".to_string(), "b".to_string()];
        let err = cache
            .get_or_compute_batch(&texts, |_| async { Ok(vec![vec![1.0]]) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Dependency(DependencyError::Misbehaving { .. })
        ));
    }

    #[tokio::test]
    async fn test_disk_mirror_warm_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embedding_cache.json");

        {
            let cache = EmbeddingCache::new(10, Some(path.clone()));
            cache.put("persisted", vec![7.0, 8.0]).await;
            cache.flush().await;
        }

        let cache = EmbeddingCache::new(10, Some(path));
        assert_eq!(cache.get("persisted").await, Some(vec![7.0, 8.0]));
    }

    #[tokio::test]
    async fn test_embed_with_caches_model_output() {
        let cache = EmbeddingCache::new(10, None);
        let embedder: Arc<dyn crate::embedding::Embedder> =
            Arc::new(FallbackEmbedder::new(EMBEDDING_DIM));

        let first = cache
            .embed_with(&embedder, "query text", Duration::from_secs(30))
            .await
            .unwrap();
        let second = cache
            .embed_with(&embedder, "query text", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(first, second);

        let stats = cache.stats().await;
        assert!(stats.hits >= 1);
    }
}
