//! Crash-safe event log.
//!
//! Every user-visible action is appended to a daily JSONL file and fsynced
//! before the producing operation returns success, so no learning is lost
//! on a crash. The consolidator reads these files on its schedule.

use crate::error::{MemoryError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Tracked event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A source was accepted into a notebook.
    SourceAccepted,
    /// A source was rejected by the user.
    SourceRejected,
    /// A question was asked and answered.
    ChatQa,
    /// The user created a highlight.
    HighlightCreated,
    /// A document was captured.
    DocumentCaptured,
    /// A document was read.
    DocumentRead,
    /// A search was performed.
    SearchPerformed,
    /// A note was added.
    NoteAdded,
}

impl EventKind {
    /// Wire string for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SourceAccepted => "source_accepted",
            Self::SourceRejected => "source_rejected",
            Self::ChatQa => "chat_qa",
            Self::HighlightCreated => "highlight_created",
            Self::DocumentCaptured => "document_captured",
            Self::DocumentRead => "document_read",
            Self::SearchPerformed => "search_performed",
            Self::NoteAdded => "note_added",
        }
    }
}

/// One logged event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Event kind.
    pub event_type: EventKind,
    /// Notebook the event belongs to.
    pub notebook_id: String,
    /// Source involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Opaque payload.
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl MemoryEvent {
    /// Creates an event stamped now.
    #[must_use]
    pub fn new(
        event_type: EventKind,
        notebook_id: &str,
        source_id: Option<&str>,
        data: HashMap<String, Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            notebook_id: notebook_id.to_string(),
            source_id: source_id.map(String::from),
            data,
        }
    }
}

/// Append-only JSONL event log with daily rotation.
pub struct EventLog {
    events_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLog {
    /// Creates the log rooted at `events_dir`, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(events_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&events_dir)
            .map_err(|e| MemoryError::EventLog(e.to_string()))?;
        Ok(Self {
            events_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the daily log files.
    #[must_use]
    pub fn dir(&self) -> &std::path::Path {
        &self.events_dir
    }

    fn log_path_for(&self, date: NaiveDate) -> PathBuf {
        self.events_dir
            .join(format!("events_{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Appends an event and fsyncs before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or sync fails.
    pub async fn append(&self, event: &MemoryEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let path = self.log_path_for(event.timestamp.date_naive());

        let _guard = self.write_lock.lock().await;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| MemoryError::EventLog(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| MemoryError::EventLog(e.to_string()))?;
        file.sync_data()
            .map_err(|e| MemoryError::EventLog(e.to_string()))?;
        Ok(())
    }

    /// Convenience append.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn log(
        &self,
        event_type: EventKind,
        notebook_id: &str,
        source_id: Option<&str>,
        data: HashMap<String, Value>,
    ) -> Result<()> {
        self.append(&MemoryEvent::new(event_type, notebook_id, source_id, data))
            .await
    }

    /// Reads events since a given time, optionally filtered by notebook and
    /// kind. Unparseable lines are skipped with a warning.
    pub async fn events_since(
        &self,
        since: DateTime<Utc>,
        notebook_id: Option<&str>,
        kinds: Option<&[EventKind]>,
    ) -> Vec<MemoryEvent> {
        let mut events = Vec::new();

        let mut paths: Vec<PathBuf> = match std::fs::read_dir(&self.events_dir) {
            Ok(entries) => entries
                .filter_map(std::result::Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("events_") && n.ends_with(".jsonl"))
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "event log directory unreadable");
                return events;
            }
        };
        paths.sort();

        for path in paths {
            if let Some(date) = file_date(&path)
                && date < since.date_naive()
            {
                continue;
            }

            let Ok(content) = std::fs::read_to_string(&path) else {
                warn!(path = %path.display(), "event log file unreadable");
                continue;
            };

            for line in content.lines() {
                match serde_json::from_str::<MemoryEvent>(line) {
                    Ok(event) => {
                        if event.timestamp < since {
                            continue;
                        }
                        if let Some(nb) = notebook_id
                            && event.notebook_id != nb
                        {
                            continue;
                        }
                        if let Some(kinds) = kinds
                            && !kinds.contains(&event.event_type)
                        {
                            continue;
                        }
                        events.push(event);
                    }
                    Err(e) => debug!(error = %e, "skipping unparseable event line"),
                }
            }
        }

        events
    }

    /// Event counts by kind, for pattern analysis and debugging.
    pub async fn event_counts(&self, notebook_id: Option<&str>) -> HashMap<String, usize> {
        let epoch = DateTime::<Utc>::MIN_UTC;
        let mut counts = HashMap::new();
        for event in self.events_since(epoch, notebook_id, None).await {
            *counts
                .entry(event.event_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        counts
    }

    /// Removes log files older than `days_to_keep`. Returns removed count.
    pub async fn cleanup_old_logs(&self, days_to_keep: i64) -> usize {
        let cutoff = (Utc::now() - chrono::Duration::days(days_to_keep)).date_naive();
        let mut removed = 0;

        let Ok(entries) = std::fs::read_dir(&self.events_dir) else {
            return 0;
        };
        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if let Some(date) = file_date(&path)
                && date < cutoff
                && std::fs::remove_file(&path).is_ok()
            {
                removed += 1;
                debug!(path = %path.display(), "removed old event log");
            }
        }
        removed
    }
}

fn file_date(path: &std::path::Path) -> Option<NaiveDate> {
    let name = path.file_stem()?.to_str()?;
    let date_str = name.strip_prefix("events_")?;
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events")).unwrap();
        (dir, log)
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let (_dir, log) = log();
        log.log(EventKind::ChatQa, "nb", None, HashMap::new())
            .await
            .unwrap();
        log.log(EventKind::SourceAccepted, "nb", Some("s1"), HashMap::new())
            .await
            .unwrap();

        let events = log
            .events_since(DateTime::<Utc>::MIN_UTC, None, None)
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].source_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_filters() {
        let (_dir, log) = log();
        log.log(EventKind::ChatQa, "nb1", None, HashMap::new())
            .await
            .unwrap();
        log.log(EventKind::SearchPerformed, "nb2", None, HashMap::new())
            .await
            .unwrap();

        let nb1 = log
            .events_since(DateTime::<Utc>::MIN_UTC, Some("nb1"), None)
            .await;
        assert_eq!(nb1.len(), 1);

        let searches = log
            .events_since(
                DateTime::<Utc>::MIN_UTC,
                None,
                Some(&[EventKind::SearchPerformed]),
            )
            .await;
        assert_eq!(searches.len(), 1);
        assert_eq!(searches[0].notebook_id, "nb2");
    }

    #[tokio::test]
    async fn test_daily_file_naming() {
        let (_dir, log) = log();
        log.log(EventKind::NoteAdded, "nb", None, HashMap::new())
            .await
            .unwrap();

        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        assert!(log.events_dir.join(format!("events_{today}.jsonl")).exists());
    }

    #[tokio::test]
    async fn test_corrupt_lines_skipped() {
        let (_dir, log) = log();
        log.log(EventKind::NoteAdded, "nb", None, HashMap::new())
            .await
            .unwrap();

        // Corrupt the file with a half-written line
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let path = log.events_dir.join(format!("events_{today}.jsonl"));
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{broken json\n");
        std::fs::write(&path, content).unwrap();

        let events = log
            .events_since(DateTime::<Utc>::MIN_UTC, None, None)
            .await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_event_counts() {
        let (_dir, log) = log();
        for _ in 0..3 {
            log.log(EventKind::ChatQa, "nb", None, HashMap::new())
                .await
                .unwrap();
        }
        let counts = log.event_counts(None).await;
        assert_eq!(counts.get("chat_qa"), Some(&3));
    }

    #[tokio::test]
    async fn test_cleanup_old_logs() {
        let (_dir, log) = log();
        // Fabricate an old log file
        let old = log.events_dir.join("events_2020-01-01.jsonl");
        std::fs::write(&old, "{}\n").unwrap();

        let removed = log.cleanup_old_logs(7).await;
        assert_eq!(removed, 1);
        assert!(!old.exists());
    }
}
