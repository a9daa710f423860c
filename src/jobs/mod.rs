//! Durable, concurrency-bounded job queue.
//!
//! Long operations get a job id with monotonic status transitions
//! (`pending -> running -> completed | failed | cancelled`), progress
//! reporting, and cooperative cancellation. A semaphore bounds parallelism;
//! completed jobs are retained up to a bounded count. Handler failures mark
//! the job failed - the queue itself never crashes.

use crate::error::{JobError, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Completed/failed/cancelled jobs retained in memory.
pub const MAX_COMPLETED_JOBS: usize = 100;

/// Job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Rebuild topic/community structures for a notebook.
    TopicRebuild,
    /// Ingest a single document.
    DocumentIngest,
    /// Ingest a batch of documents.
    BatchIngest,
    /// Run entity backfill over existing chunks.
    EntityBackfill,
    /// Export a notebook.
    Export,
    /// Caller-defined work.
    Custom,
}

impl JobKind {
    /// Wire string for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TopicRebuild => "topic_rebuild",
            Self::DocumentIngest => "document_ingest",
            Self::BatchIngest => "batch_ingest",
            Self::EntityBackfill => "entity_backfill",
            Self::Export => "export",
            Self::Custom => "custom",
        }
    }
}

/// Job status. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a permit.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Handler returned an error.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Progress report from a handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    /// Percent complete (0-100).
    pub percent: u8,
    /// Human-readable status line.
    pub message: String,
    /// Current step number.
    pub current_step: usize,
    /// Total steps, when known.
    pub total_steps: usize,
    /// Arbitrary details.
    #[serde(default)]
    pub details: HashMap<String, Value>,
}

/// Snapshot of a job's state, safe to hand to listeners.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    /// Job id.
    pub id: String,
    /// Job kind.
    pub kind: JobKind,
    /// Current status.
    pub status: JobStatus,
    /// Latest progress.
    pub progress: JobProgress,
    /// Handler parameters.
    pub params: Value,
    /// Result, present once completed.
    pub result: Option<Value>,
    /// Error message, present once failed.
    pub error: Option<String>,
    /// Notebook context, if any.
    pub notebook_id: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Execution start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Cooperative cancellation flag handed to handlers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Progress reporting handle handed to handlers.
#[derive(Clone)]
pub struct ProgressSender {
    job_id: String,
    queue: Arc<QueueInner>,
}

impl ProgressSender {
    /// Reports progress; listeners receive the updated snapshot.
    pub async fn report(&self, progress: JobProgress) {
        let snapshot = {
            let mut jobs = self.queue.jobs.lock().await;
            let Some(job) = jobs.get_mut(&self.job_id) else {
                return;
            };
            job.progress = progress;
            job.snapshot()
        };
        self.queue.notify(&snapshot);
    }
}

/// Handler signature: params, progress handle, cancel flag.
pub type JobHandler = Arc<
    dyn Fn(Value, ProgressSender, CancelFlag) -> BoxFuture<'static, Result<Value>> + Send + Sync,
>;

struct JobRecord {
    id: String,
    kind: JobKind,
    status: JobStatus,
    progress: JobProgress,
    params: Value,
    result: Option<Value>,
    error: Option<String>,
    notebook_id: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancel: CancelFlag,
    handle: Option<JoinHandle<()>>,
}

impl JobRecord {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            progress: self.progress.clone(),
            params: self.params.clone(),
            result: if self.status == JobStatus::Completed {
                self.result.clone()
            } else {
                None
            },
            error: self.error.clone(),
            notebook_id: self.notebook_id.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

struct QueueInner {
    jobs: Mutex<HashMap<String, JobRecord>>,
    handlers: std::sync::RwLock<HashMap<JobKind, JobHandler>>,
    semaphore: Arc<Semaphore>,
    listeners: broadcast::Sender<JobSnapshot>,
    counter: std::sync::atomic::AtomicU64,
}

impl QueueInner {
    fn notify(&self, snapshot: &JobSnapshot) {
        // No receivers is fine; updates are fire-and-forget
        let _ = self.listeners.send(snapshot.clone());
    }
}

/// Async job queue with status tracking and progress reporting.
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    /// Creates a queue with the given concurrency bound.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        let (listeners, _) = broadcast::channel(256);
        info!(max_concurrent, "job queue initialized");
        Self {
            inner: Arc::new(QueueInner {
                jobs: Mutex::new(HashMap::new()),
                handlers: std::sync::RwLock::new(HashMap::new()),
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                listeners,
                counter: std::sync::atomic::AtomicU64::new(1),
            }),
        }
    }

    /// Registers a handler for a job kind.
    pub fn register_handler(&self, kind: JobKind, handler: JobHandler) {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.insert(kind, handler);
            debug!(kind = kind.as_str(), "job handler registered");
        }
    }

    /// Subscribes to job updates (every progress report and status change,
    /// across all jobs).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobSnapshot> {
        self.inner.listeners.subscribe()
    }

    /// Submits a job. Returns its id immediately; the handler runs once a
    /// semaphore permit is available.
    ///
    /// Jobs are never rejected for capacity - they queue on the semaphore.
    pub async fn submit(
        &self,
        kind: JobKind,
        params: Value,
        notebook_id: Option<&str>,
        handler: Option<JobHandler>,
    ) -> String {
        let seq = self.inner.counter.fetch_add(1, Ordering::SeqCst);
        let job_id = format!("job_{seq:08x}");

        let registered = handler.or_else(|| {
            self.inner
                .handlers
                .read()
                .ok()
                .and_then(|h| h.get(&kind).cloned())
        });

        let cancel = CancelFlag::default();
        let record = JobRecord {
            id: job_id.clone(),
            kind,
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            params: params.clone(),
            result: None,
            error: None,
            notebook_id: notebook_id.map(String::from),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancel: cancel.clone(),
            handle: None,
        };

        let snapshot = record.snapshot();
        self.inner.jobs.lock().await.insert(job_id.clone(), record);
        self.inner.notify(&snapshot);

        let Some(handler) = registered else {
            let snapshot = self
                .transition(&job_id, JobStatus::Failed, None, Some(
                    JobError::HandlerMissing {
                        kind: kind.as_str().to_string(),
                    }
                    .to_string(),
                ))
                .await;
            if let Some(snapshot) = snapshot {
                self.inner.notify(&snapshot);
            }
            return job_id;
        };

        let inner = Arc::clone(&self.inner);
        let exec_job_id = job_id.clone();
        let handle = tokio::spawn(async move {
            Self::execute(inner, exec_job_id, handler, params, cancel).await;
        });

        if let Some(record) = self.inner.jobs.lock().await.get_mut(&job_id) {
            record.handle = Some(handle);
        }

        debug!(job_id, kind = kind.as_str(), "job submitted");
        job_id
    }

    async fn execute(
        inner: Arc<QueueInner>,
        job_id: String,
        handler: JobHandler,
        params: Value,
        cancel: CancelFlag,
    ) {
        let Ok(_permit) = inner.semaphore.clone().acquire_owned().await else {
            return;
        };

        // Cancelled while pending: go terminal without running
        if cancel.is_cancelled() {
            Self::finish(&inner, &job_id, JobStatus::Cancelled, None, Some("Job was cancelled")).await;
            return;
        }

        {
            let mut jobs = inner.jobs.lock().await;
            if let Some(record) = jobs.get_mut(&job_id) {
                record.status = JobStatus::Running;
                record.started_at = Some(Utc::now());
                let snapshot = record.snapshot();
                drop(jobs);
                inner.notify(&snapshot);
            }
        }

        let progress = ProgressSender {
            job_id: job_id.clone(),
            queue: Arc::clone(&inner),
        };

        let outcome = handler(params, progress, cancel.clone()).await;

        if cancel.is_cancelled() {
            Self::finish(&inner, &job_id, JobStatus::Cancelled, None, Some("Job was cancelled")).await;
            return;
        }

        match outcome {
            Ok(result) => {
                Self::finish(&inner, &job_id, JobStatus::Completed, Some(result), None).await;
            }
            Err(e) => {
                warn!(job_id, error = %e, "job failed");
                Self::finish(&inner, &job_id, JobStatus::Failed, None, Some(&e.to_string())).await;
            }
        }
    }

    async fn finish(
        inner: &Arc<QueueInner>,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<&str>,
    ) {
        let snapshot = {
            let mut jobs = inner.jobs.lock().await;
            let Some(record) = jobs.get_mut(job_id) else {
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            record.status = status;
            record.result = result;
            record.error = error.map(String::from);
            record.completed_at = Some(Utc::now());
            if status == JobStatus::Completed {
                record.progress.percent = 100;
                record.progress.message = "Completed".to_string();
            }
            let snapshot = record.snapshot();

            // Retention: prune oldest terminal jobs beyond the bound
            let mut terminal: Vec<(String, DateTime<Utc>)> = jobs
                .values()
                .filter(|j| j.status.is_terminal())
                .map(|j| (j.id.clone(), j.completed_at.unwrap_or(j.created_at)))
                .collect();
            if terminal.len() > MAX_COMPLETED_JOBS {
                terminal.sort_by_key(|(_, at)| *at);
                let excess = terminal.len() - MAX_COMPLETED_JOBS;
                for (id, _) in terminal.into_iter().take(excess) {
                    jobs.remove(&id);
                }
            }

            snapshot
        };
        inner.notify(&snapshot);
    }

    async fn transition(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Option<JobSnapshot> {
        let mut jobs = self.inner.jobs.lock().await;
        let record = jobs.get_mut(job_id)?;
        record.status = status;
        record.result = result;
        record.error = error;
        record.completed_at = Some(Utc::now());
        Some(record.snapshot())
    }

    /// Current status snapshot for a job.
    pub async fn status(&self, job_id: &str) -> Option<JobSnapshot> {
        self.inner
            .jobs
            .lock()
            .await
            .get(job_id)
            .map(JobRecord::snapshot)
    }

    /// Result value, available only after completion.
    pub async fn result(&self, job_id: &str) -> Option<Value> {
        let jobs = self.inner.jobs.lock().await;
        let record = jobs.get(job_id)?;
        if record.status == JobStatus::Completed {
            record.result.clone()
        } else {
            None
        }
    }

    /// Requests cancellation. Running handlers see the flag at their next
    /// checkpoint; the task is also aborted for non-cooperative work.
    ///
    /// Returns `true` when cancellation was requested, `false` when the job
    /// is unknown or already terminal.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let handle = {
            let mut jobs = self.inner.jobs.lock().await;
            let Some(record) = jobs.get_mut(job_id) else {
                return false;
            };
            if record.status.is_terminal() {
                return false;
            }
            record.cancel.set();
            record.handle.take()
        };

        if let Some(handle) = handle {
            handle.abort();
        }
        Self::finish(&self.inner, job_id, JobStatus::Cancelled, None, Some("Job was cancelled")).await;
        info!(job_id, "job cancelled");
        true
    }

    /// Lists jobs, newest first, optionally filtered.
    pub async fn list(
        &self,
        notebook_id: Option<&str>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Vec<JobSnapshot> {
        let jobs = self.inner.jobs.lock().await;
        let mut snapshots: Vec<JobSnapshot> = jobs
            .values()
            .filter(|j| notebook_id.is_none_or(|nb| j.notebook_id.as_deref() == Some(nb)))
            .filter(|j| status.is_none_or(|s| j.status == s))
            .map(JobRecord::snapshot)
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots.truncate(limit);
        snapshots
    }

    /// Waits for a job to reach a terminal status.
    ///
    /// Returns the final snapshot, or `None` on timeout or unknown id.
    pub async fn wait_for(
        &self,
        job_id: &str,
        timeout: std::time::Duration,
    ) -> Option<JobSnapshot> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.status(job_id).await?;
            if snapshot.status.is_terminal() {
                return Some(snapshot);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    /// Queue statistics by status.
    pub async fn stats(&self) -> HashMap<String, usize> {
        let jobs = self.inner.jobs.lock().await;
        let mut stats: HashMap<String, usize> = HashMap::new();
        for record in jobs.values() {
            let key = match record.status {
                JobStatus::Pending => "pending",
                JobStatus::Running => "running",
                JobStatus::Completed => "completed",
                JobStatus::Failed => "failed",
                JobStatus::Cancelled => "cancelled",
            };
            *stats.entry(key.to_string()).or_insert(0) += 1;
        }
        stats.insert("total".to_string(), jobs.len());
        stats
    }
}
