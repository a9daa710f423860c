//! Long-term memory store.
//!
//! Three tiers: core (small, always-loaded facts), recall (conversation
//! entries, compressed into summaries over time), and archival (bulk
//! knowledge with access tracking). The consolidator demotes stale core
//! entries into archival and prunes archival entries nobody reads.

use crate::persist::{load_json_or_default, save_json_atomic};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Importance level for memory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryImportance {
    /// Disposable.
    Low,
    /// Default.
    Normal,
    /// Keep longer.
    High,
    /// Never auto-demoted.
    Critical,
}

/// A core memory entry: a small key fact kept hot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreMemoryEntry {
    /// Entry key.
    pub key: String,
    /// Entry value.
    pub value: String,
    /// Importance; critical entries are never demoted.
    pub importance: MemoryImportance,
    /// Times this entry was read.
    #[serde(default)]
    pub access_count: u64,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// An archival memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivalEntry {
    /// Entry id.
    pub id: String,
    /// Entry content.
    pub content: String,
    /// Content classification (e.g. `demoted_core_memory`).
    pub content_type: String,
    /// Importance.
    pub importance: MemoryImportance,
    /// Times this entry was read.
    #[serde(default)]
    pub access_count: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A recall entry: one conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallEntry {
    /// Conversation the entry belongs to.
    pub conversation_id: String,
    /// Entry content.
    pub content: String,
    /// Entry time.
    pub timestamp: DateTime<Utc>,
    /// Whether a summary has replaced this entry's detail.
    #[serde(default)]
    pub is_summarized: bool,
}

/// A negative/positive user signal for downstream collector tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSignal {
    /// Notebook the signal belongs to.
    pub notebook_id: String,
    /// Signal type: `click`, `search_miss`, or `ignored`.
    pub signal_type: String,
    /// Query or item the signal refers to.
    pub subject: String,
    /// Signal time.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryState {
    core: Vec<CoreMemoryEntry>,
    recall: Vec<RecallEntry>,
    archival: Vec<ArchivalEntry>,
    signals: Vec<UserSignal>,
    #[serde(default)]
    next_archival_id: u64,
}

/// JSON-backed three-tier memory store.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    persist_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Creates a store backed by `path` (`None` for memory-only).
    #[must_use]
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        let state: MemoryState = persist_path
            .as_deref()
            .map(load_json_or_default)
            .unwrap_or_default();
        Self {
            state: Mutex::new(state),
            persist_path,
        }
    }

    /// Upserts a core memory entry by key.
    pub async fn upsert_core(&self, key: &str, value: &str, importance: MemoryImportance) {
        let mut state = self.state.lock().await;
        match state.core.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                entry.value = value.to_string();
                entry.importance = importance;
                entry.updated_at = Utc::now();
            }
            None => state.core.push(CoreMemoryEntry {
                key: key.to_string(),
                value: value.to_string(),
                importance,
                access_count: 0,
                updated_at: Utc::now(),
            }),
        }
        self.save_locked(&state);
    }

    /// Reads a core entry, bumping its access count.
    pub async fn read_core(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        let entry = state.core.iter_mut().find(|e| e.key == key)?;
        entry.access_count += 1;
        Some(entry.value.clone())
    }

    /// All core entries.
    pub async fn core_entries(&self) -> Vec<CoreMemoryEntry> {
        self.state.lock().await.core.clone()
    }

    /// Appends a recall entry.
    pub async fn add_recall(&self, conversation_id: &str, content: &str) {
        let mut state = self.state.lock().await;
        state.recall.push(RecallEntry {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            is_summarized: false,
        });
        self.save_locked(&state);
    }

    /// Count of recall entries.
    pub async fn recall_count(&self) -> usize {
        self.state.lock().await.recall.len()
    }

    /// Adds an archival entry and returns its id.
    pub async fn add_archival(
        &self,
        content: &str,
        content_type: &str,
        importance: MemoryImportance,
    ) -> String {
        let mut state = self.state.lock().await;
        state.next_archival_id += 1;
        let id = format!("arch_{:08x}", state.next_archival_id);
        state.archival.push(ArchivalEntry {
            id: id.clone(),
            content: content.to_string(),
            content_type: content_type.to_string(),
            importance,
            access_count: 0,
            created_at: Utc::now(),
        });
        self.save_locked(&state);
        id
    }

    /// All archival entries.
    pub async fn archival_entries(&self) -> Vec<ArchivalEntry> {
        self.state.lock().await.archival.clone()
    }

    /// Records a user signal.
    pub async fn record_signal(&self, notebook_id: &str, signal_type: &str, subject: &str) {
        let mut state = self.state.lock().await;
        state.signals.push(UserSignal {
            notebook_id: notebook_id.to_string(),
            signal_type: signal_type.to_string(),
            subject: subject.to_string(),
            timestamp: Utc::now(),
        });
        self.save_locked(&state);
    }

    /// Signals of a type for a notebook, consuming them.
    pub async fn take_signals(&self, notebook_id: &str, signal_type: &str) -> Vec<UserSignal> {
        let mut state = self.state.lock().await;
        let (matching, rest): (Vec<UserSignal>, Vec<UserSignal>) = state
            .signals
            .drain(..)
            .partition(|s| s.notebook_id == notebook_id && s.signal_type == signal_type);
        state.signals = rest;
        if !matching.is_empty() {
            self.save_locked(&state);
        }
        matching
    }

    /// Notebook ids that currently have recorded signals.
    pub async fn notebooks_with_signals(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut notebooks = Vec::new();
        for signal in &state.signals {
            if !notebooks.contains(&signal.notebook_id) {
                notebooks.push(signal.notebook_id.clone());
            }
        }
        notebooks
    }

    /// Compresses recall groups: conversations with 5+ unsummarized entries
    /// older than `age_days` are marked summarized. Returns the number of
    /// entries compressed. Idempotent.
    pub async fn compress_recall(&self, age_days: i64) -> usize {
        let cutoff = Utc::now() - Duration::days(age_days);
        let mut state = self.state.lock().await;

        let mut by_conversation: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        for entry in &state.recall {
            if !entry.is_summarized && entry.timestamp < cutoff {
                *by_conversation
                    .entry(entry.conversation_id.clone())
                    .or_insert(0) += 1;
            }
        }

        let eligible: std::collections::HashSet<String> = by_conversation
            .into_iter()
            .filter(|(_, count)| *count >= 5)
            .map(|(id, _)| id)
            .collect();

        let mut compressed = 0;
        for entry in &mut state.recall {
            if !entry.is_summarized
                && entry.timestamp < cutoff
                && eligible.contains(&entry.conversation_id)
            {
                entry.is_summarized = true;
                compressed += 1;
            }
        }

        if compressed > 0 {
            self.save_locked(&state);
            debug!(compressed, "recall entries compressed");
        }
        compressed
    }

    /// Prunes archival entries older than `age_days` with zero accesses.
    /// Returns the number pruned. Idempotent.
    pub async fn prune_archival(&self, age_days: i64) -> usize {
        let cutoff = Utc::now() - Duration::days(age_days);
        let mut state = self.state.lock().await;
        let before = state.archival.len();
        state
            .archival
            .retain(|e| e.access_count > 0 || e.created_at >= cutoff);
        let pruned = before - state.archival.len();
        if pruned > 0 {
            self.save_locked(&state);
            debug!(pruned, "archival entries pruned");
        }
        pruned
    }

    /// Demotes core entries not updated in `stale_days` with fewer than 3
    /// accesses and importance below critical into archival. Returns the
    /// number demoted. Idempotent.
    pub async fn demote_stale_core(&self, stale_days: i64) -> usize {
        let cutoff = Utc::now() - Duration::days(stale_days);
        let mut state = self.state.lock().await;

        let (stale, keep): (Vec<CoreMemoryEntry>, Vec<CoreMemoryEntry>) =
            state.core.drain(..).partition(|e| {
                e.updated_at < cutoff
                    && e.access_count < 3
                    && e.importance != MemoryImportance::Critical
            });
        state.core = keep;

        let demoted = stale.len();
        for entry in stale {
            state.next_archival_id += 1;
            let id = format!("arch_{:08x}", state.next_archival_id);
            state.archival.push(ArchivalEntry {
                id,
                content: format!("{}: {}", entry.key, entry.value),
                content_type: "demoted_core_memory".to_string(),
                importance: entry.importance,
                access_count: 0,
                created_at: Utc::now(),
            });
        }

        if demoted > 0 {
            self.save_locked(&state);
            debug!(demoted, "core entries demoted to archival");
        }
        demoted
    }

    fn save_locked(&self, state: &MemoryState) {
        if let Some(path) = &self.persist_path
            && let Err(e) = save_json_atomic(path, state)
        {
            warn!(error = %e, "memory store save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_core_upsert_and_read() {
        let store = MemoryStore::new(None);
        store
            .upsert_core("focus", "Q1 pipeline", MemoryImportance::Normal)
            .await;
        store
            .upsert_core("focus", "Q2 pipeline", MemoryImportance::High)
            .await;

        assert_eq!(store.read_core("focus").await.as_deref(), Some("Q2 pipeline"));
        let entries = store.core_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].access_count, 1);
    }

    #[tokio::test]
    async fn test_compress_recall_requires_group_of_five() {
        let store = MemoryStore::new(None);
        for i in 0..6 {
            store.add_recall("conv1", &format!("turn {i}")).await;
        }
        store.add_recall("conv2", "lone turn").await;

        // Entries are new, so nothing is older than the cutoff
        assert_eq!(store.compress_recall(7).await, 0);

        // Backdate everything past the cutoff
        {
            let mut state = store.state.lock().await;
            for entry in &mut state.recall {
                entry.timestamp = Utc::now() - Duration::days(8);
            }
        }
        // conv1 has 6 entries (>= 5): compressed; conv2 has 1: untouched
        assert_eq!(store.compress_recall(7).await, 6);
        // Idempotent
        assert_eq!(store.compress_recall(7).await, 0);
    }

    #[tokio::test]
    async fn test_prune_archival_keeps_accessed() {
        let store = MemoryStore::new(None);
        store
            .add_archival("never read", "note", MemoryImportance::Low)
            .await;
        store
            .add_archival("was read", "note", MemoryImportance::Low)
            .await;

        {
            let mut state = store.state.lock().await;
            for entry in &mut state.archival {
                entry.created_at = Utc::now() - Duration::days(100);
            }
            state.archival[1].access_count = 2;
        }

        assert_eq!(store.prune_archival(90).await, 1);
        let remaining = store.archival_entries().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "was read");
    }

    #[tokio::test]
    async fn test_demote_stale_core_respects_critical() {
        let store = MemoryStore::new(None);
        store
            .upsert_core("stale", "old fact", MemoryImportance::Normal)
            .await;
        store
            .upsert_core("vital", "critical fact", MemoryImportance::Critical)
            .await;

        {
            let mut state = store.state.lock().await;
            for entry in &mut state.core {
                entry.updated_at = Utc::now() - Duration::days(40);
            }
        }

        assert_eq!(store.demote_stale_core(30).await, 1);
        let core = store.core_entries().await;
        assert_eq!(core.len(), 1);
        assert_eq!(core[0].key, "vital");

        let archival = store.archival_entries().await;
        assert_eq!(archival.len(), 1);
        assert_eq!(archival[0].content_type, "demoted_core_memory");
        assert!(archival[0].content.contains("stale"));
    }

    #[tokio::test]
    async fn test_signals_taken_once() {
        let store = MemoryStore::new(None);
        store.record_signal("nb", "search_miss", "lost query").await;
        store.record_signal("nb", "click", "good result").await;

        let misses = store.take_signals("nb", "search_miss").await;
        assert_eq!(misses.len(), 1);
        assert!(store.take_signals("nb", "search_miss").await.is_empty());
        // Other signal types remain
        assert_eq!(store.take_signals("nb", "click").await.len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory_store.json");
        {
            let store = MemoryStore::new(Some(path.clone()));
            store
                .upsert_core("k", "v", MemoryImportance::Normal)
                .await;
        }
        let store = MemoryStore::new(Some(path));
        assert_eq!(store.read_core("k").await.as_deref(), Some("v"));
    }
}
