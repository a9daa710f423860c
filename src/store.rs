//! Notebook and source stores.
//!
//! JSON-backed maps with atomic writes. The ingestion service mutates them;
//! the retrieval engine reads source kinds and tags for routing and tag
//! boosts.

use crate::core::{Notebook, Source, SourceStatus};
use crate::error::Result;
use crate::persist::{load_json_or_default, save_json_atomic};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::warn;

/// JSON-backed notebook store.
pub struct NotebookStore {
    notebooks: Mutex<HashMap<String, Notebook>>,
    persist_path: Option<PathBuf>,
}

impl NotebookStore {
    /// Creates a store backed by `path` (`None` for memory-only).
    #[must_use]
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        let notebooks: HashMap<String, Notebook> = persist_path
            .as_deref()
            .map(load_json_or_default)
            .unwrap_or_default();
        Self {
            notebooks: Mutex::new(notebooks),
            persist_path,
        }
    }

    /// Creates a notebook.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInput`] if the id already exists.
    pub async fn create(&self, id: &str, title: &str) -> Result<Notebook> {
        let mut notebooks = self.notebooks.lock().await;
        if notebooks.contains_key(id) {
            return Err(crate::Error::InvalidInput {
                message: format!("notebook already exists: {id}"),
            });
        }
        let notebook = Notebook::new(id, title);
        notebooks.insert(id.to_string(), notebook.clone());
        self.save(&notebooks);
        Ok(notebook)
    }

    /// Fetches a notebook.
    pub async fn get(&self, id: &str) -> Option<Notebook> {
        self.notebooks.lock().await.get(id).cloned()
    }

    /// Lists all notebooks.
    pub async fn list(&self) -> Vec<Notebook> {
        let mut notebooks: Vec<Notebook> =
            self.notebooks.lock().await.values().cloned().collect();
        notebooks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        notebooks
    }

    /// Deletes a notebook. Cascading cleanup of sources, index rows, and
    /// graph data is the ingestion service's job.
    pub async fn delete(&self, id: &str) -> bool {
        let mut notebooks = self.notebooks.lock().await;
        let removed = notebooks.remove(id).is_some();
        if removed {
            self.save(&notebooks);
        }
        removed
    }

    /// Adjusts the cached source count.
    pub async fn set_source_count(&self, id: &str, count: usize) {
        let mut notebooks = self.notebooks.lock().await;
        if let Some(notebook) = notebooks.get_mut(id) {
            notebook.source_count = count;
            notebook.updated_at = Utc::now();
        }
        self.save(&notebooks);
    }

    fn save(&self, notebooks: &HashMap<String, Notebook>) {
        if let Some(path) = &self.persist_path
            && let Err(e) = save_json_atomic(path, notebooks)
        {
            warn!(error = %e, "notebook store save failed");
        }
    }
}

/// JSON-backed source store.
pub struct SourceStore {
    sources: Mutex<HashMap<String, Source>>,
    persist_path: Option<PathBuf>,
}

impl SourceStore {
    /// Creates a store backed by `path` (`None` for memory-only).
    #[must_use]
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        let sources: HashMap<String, Source> = persist_path
            .as_deref()
            .map(load_json_or_default)
            .unwrap_or_default();
        Self {
            sources: Mutex::new(sources),
            persist_path,
        }
    }

    /// Inserts or replaces a source.
    pub async fn put(&self, source: Source) {
        let mut sources = self.sources.lock().await;
        sources.insert(source.id.clone(), source);
        self.save(&sources);
    }

    /// Fetches a source.
    pub async fn get(&self, id: &str) -> Option<Source> {
        self.sources.lock().await.get(id).cloned()
    }

    /// Lists every source across all notebooks.
    pub async fn list_all(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = self.sources.lock().await.values().cloned().collect();
        sources.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sources
    }

    /// Lists sources for a notebook.
    pub async fn list_for_notebook(&self, notebook_id: &str) -> Vec<Source> {
        let mut sources: Vec<Source> = self
            .sources
            .lock()
            .await
            .values()
            .filter(|s| s.notebook_id == notebook_id)
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sources
    }

    /// Applies a mutation to a source under the lock.
    ///
    /// Returns the updated source, or `None` if it does not exist.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Option<Source>
    where
        F: FnOnce(&mut Source),
    {
        let mut sources = self.sources.lock().await;
        let source = sources.get_mut(id)?;
        mutate(source);
        source.updated_at = Utc::now();
        let updated = source.clone();
        self.save(&sources);
        Some(updated)
    }

    /// Marks ingestion status with an optional error reason.
    pub async fn set_status(
        &self,
        id: &str,
        status: SourceStatus,
        chunk_count: Option<usize>,
        error: Option<&str>,
    ) -> Option<Source> {
        self.update(id, |source| {
            source.status = status;
            if let Some(count) = chunk_count {
                source.chunk_count = count;
            }
            source.error = error.map(crate::Error::truncate_reason);
        })
        .await
    }

    /// Deletes a source.
    pub async fn delete(&self, id: &str) -> Option<Source> {
        let mut sources = self.sources.lock().await;
        let removed = sources.remove(id);
        if removed.is_some() {
            self.save(&sources);
        }
        removed
    }

    /// All distinct tags in a notebook.
    pub async fn notebook_tags(&self, notebook_id: &str) -> Vec<String> {
        let sources = self.sources.lock().await;
        let mut tags: Vec<String> = Vec::new();
        for source in sources.values().filter(|s| s.notebook_id == notebook_id) {
            for tag in &source.tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
        }
        tags
    }

    fn save(&self, sources: &HashMap<String, Source>) {
        if let Some(path) = &self.persist_path
            && let Err(e) = save_json_atomic(path, sources)
        {
            warn!(error = %e, "source store save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SourceKind;

    #[tokio::test]
    async fn test_notebook_crud() {
        let store = NotebookStore::new(None);
        store.create("n1", "Research").await.unwrap();
        assert!(store.create("n1", "Duplicate").await.is_err());

        assert_eq!(store.get("n1").await.unwrap().title, "Research");
        assert_eq!(store.list().await.len(), 1);
        assert!(store.delete("n1").await);
        assert!(store.get("n1").await.is_none());
    }

    #[tokio::test]
    async fn test_source_status_transitions() {
        let store = SourceStore::new(None);
        store
            .put(Source::new("s1", "n1", "doc.pdf", SourceKind::Pdf))
            .await;

        store
            .set_status("s1", SourceStatus::Processing, None, None)
            .await;
        assert_eq!(
            store.get("s1").await.unwrap().status,
            SourceStatus::Processing
        );

        store
            .set_status("s1", SourceStatus::Completed, Some(5), None)
            .await;
        let source = store.get("s1").await.unwrap();
        assert_eq!(source.status, SourceStatus::Completed);
        assert_eq!(source.chunk_count, 5);
    }

    #[tokio::test]
    async fn test_failure_reason_truncated() {
        let store = SourceStore::new(None);
        store
            .put(Source::new("s1", "n1", "doc.pdf", SourceKind::Pdf))
            .await;

        let long_reason = "e".repeat(500);
        store
            .set_status("s1", SourceStatus::Failed, None, Some(&long_reason))
            .await;
        let source = store.get("s1").await.unwrap();
        assert!(source.error.unwrap().len() <= 200);
    }

    #[tokio::test]
    async fn test_notebook_tags_deduped() {
        let store = SourceStore::new(None);
        let mut s1 = Source::new("s1", "n1", "a.pdf", SourceKind::Pdf);
        s1.set_tags(["finance", "q1"]);
        let mut s2 = Source::new("s2", "n1", "b.pdf", SourceKind::Pdf);
        s2.set_tags(["finance", "strategy"]);
        store.put(s1).await;
        store.put(s2).await;

        let tags = store.notebook_tags("n1").await;
        assert_eq!(tags.len(), 3);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        {
            let store = SourceStore::new(Some(path.clone()));
            store
                .put(Source::new("s1", "n1", "doc.pdf", SourceKind::Pdf))
                .await;
        }
        let store = SourceStore::new(Some(path));
        assert!(store.get("s1").await.is_some());
    }
}
