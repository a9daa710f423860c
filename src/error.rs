//! Error types for carrel operations.
//!
//! This module provides the error hierarchy using `thiserror` for all core
//! operations: indexing, chunking, ingestion, querying, jobs, and memory.
//!
//! The retrieval path never propagates errors to the caller - it degrades
//! into low-confidence responses instead. Errors here surface from the
//! ingestion API, the job queue, and storage maintenance.

use thiserror::Error;

/// Result type alias for carrel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for carrel operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Hybrid index errors (database operations).
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Chunking errors (text segmentation).
    #[error("chunking error: {0}")]
    Chunking(#[from] ChunkingError),

    /// External dependency errors (LLM, embedding model, web search).
    #[error("dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// Job queue errors.
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// Memory tier errors (event log, consolidation stores).
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Invalid caller input (bad notebook id, empty text, oversized payload).
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the invalid input.
        message: String,
    },

    /// Ingestion failure for a specific source.
    #[error("ingestion failed for source {source_id}: {reason}")]
    Ingest {
        /// Source that failed to ingest.
        source_id: String,
        /// Reason, truncated to 200 chars when stored on the source.
        reason: String,
    },

    /// On-disk state could not be parsed. Callers log and reinitialize.
    #[error("data corruption in {path}: {reason}")]
    DataCorruption {
        /// Path of the unreadable file.
        path: String,
        /// Parse failure description.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration errors.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(String),

    /// Any uncaught internal condition, tagged with the pipeline stage.
    #[error("internal error at {stage}: {message}")]
    Internal {
        /// Pipeline stage where the error occurred.
        stage: String,
        /// Error description.
        message: String,
    },
}

/// Hybrid-index errors for database operations.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Database connection or query error.
    #[error("database error: {0}")]
    Database(String),

    /// Notebook has no index table yet.
    #[error("notebook not indexed: {notebook_id}")]
    NotebookNotFound {
        /// Notebook id that was not found.
        notebook_id: String,
    },

    /// Stored vector dimension does not match the current embedding model.
    #[error("embedding dimension mismatch: index has {found}, model produces {expected}")]
    DimensionMismatch {
        /// Dimension the current model produces.
        expected: usize,
        /// Dimension found in a sample index row.
        found: usize,
    },

    /// Schema migration error.
    #[error("migration error: {0}")]
    Migration(String),
}

/// Chunking errors for text segmentation.
#[derive(Error, Debug)]
pub enum ChunkingError {
    /// Invalid chunk configuration.
    #[error("invalid chunk configuration: {reason}")]
    InvalidConfig {
        /// Reason the configuration is invalid.
        reason: String,
    },

    /// Overlap exceeds chunk size.
    #[error("overlap {overlap} must be less than chunk size {size}")]
    OverlapTooLarge {
        /// Overlap size.
        overlap: usize,
        /// Chunk size.
        size: usize,
    },
}

/// External dependency errors.
///
/// The core retries once with a shorter budget on `Unavailable`/`Timeout`,
/// then degrades (regex extraction, fallback analysis) or flags the response.
#[derive(Error, Debug)]
pub enum DependencyError {
    /// Dependency endpoint unreachable.
    #[error("{name} unavailable: {reason}")]
    Unavailable {
        /// Dependency name (llm, embedding, search, scrape).
        name: String,
        /// Failure description.
        reason: String,
    },

    /// Dependency call exceeded its timeout budget.
    #[error("{name} timed out after {seconds}s")]
    Timeout {
        /// Dependency name.
        name: String,
        /// Timeout budget that was exceeded.
        seconds: u64,
    },

    /// Dependency returned output the core could not parse.
    #[error("{name} returned unparseable output: {reason}")]
    Misbehaving {
        /// Dependency name.
        name: String,
        /// Parse failure description.
        reason: String,
    },
}

/// Job queue errors.
#[derive(Error, Debug)]
pub enum JobError {
    /// Job id not found in the queue.
    #[error("job not found: {id}")]
    NotFound {
        /// Job id.
        id: String,
    },

    /// No handler registered for the job kind.
    #[error("no handler registered for job kind: {kind}")]
    HandlerMissing {
        /// Job kind name.
        kind: String,
    },
}

/// Memory tier errors.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Event log append or read failure.
    #[error("event log error: {0}")]
    EventLog(String),

    /// Consolidation store failure.
    #[error("memory store error: {0}")]
    Store(String),
}

// Implement From traits for standard library and dependency errors

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Index(IndexError::Database(err.to_string()))
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Truncates a reason string for storage on a failed source.
    #[must_use]
    pub fn truncate_reason(reason: &str) -> String {
        if reason.len() > 200 {
            let mut end = 200;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason[..end].to_string()
        } else {
            reason.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput {
            message: "empty text".to_string(),
        };
        assert_eq!(err.to_string(), "invalid input: empty text");
    }

    #[test]
    fn test_index_error_display() {
        let err = IndexError::DimensionMismatch {
            expected: 1024,
            found: 768,
        };
        assert!(err.to_string().contains("1024"));
        assert!(err.to_string().contains("768"));

        let err = IndexError::NotebookNotFound {
            notebook_id: "nb-1".to_string(),
        };
        assert_eq!(err.to_string(), "notebook not indexed: nb-1");
    }

    #[test]
    fn test_chunking_error_display() {
        let err = ChunkingError::OverlapTooLarge {
            overlap: 100,
            size: 50,
        };
        assert_eq!(
            err.to_string(),
            "overlap 100 must be less than chunk size 50"
        );
    }

    #[test]
    fn test_dependency_error_display() {
        let err = DependencyError::Timeout {
            name: "llm".to_string(),
            seconds: 60,
        };
        assert_eq!(err.to_string(), "llm timed out after 60s");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::Index(IndexError::Database(_))));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("nope").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_truncate_reason() {
        let long = "x".repeat(500);
        assert_eq!(Error::truncate_reason(&long).len(), 200);
        assert_eq!(Error::truncate_reason("short"), "short");
    }

    #[test]
    fn test_truncate_reason_char_boundary() {
        // Multibyte chars must not be split mid-codepoint
        let long = "é".repeat(300);
        let truncated = Error::truncate_reason(&long);
        assert!(truncated.len() <= 200);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
