//! Notebook representation.
//!
//! The notebook is the root aggregate and the unit of retrieval isolation.
//! Deleting a notebook cascades to its sources, index rows, entities, and
//! communities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-named collection of sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notebook {
    /// Notebook identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Optional description.
    #[serde(default)]
    pub description: String,
    /// Count of sources currently owned by this notebook.
    #[serde(default)]
    pub source_count: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Notebook {
    /// Creates a new notebook.
    #[must_use]
    pub fn new(id: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            source_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
