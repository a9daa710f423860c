//! Core domain types.
//!
//! Notebooks own sources; sources produce chunks; chunks are the atomic
//! retrieval unit. These types carry no behavior beyond invariant-preserving
//! constructors - services in the sibling modules do the work.

mod chunk;
mod notebook;
mod source;

pub use chunk::{ChunkDraft, ChunkLevel, ChunkRecord};
pub use notebook::Notebook;
pub use source::{Source, SourceKind, SourceStatus, normalize_tags};

use serde::{Deserialize, Serialize};

/// A citation attached to an answer.
///
/// Citation numbers are 1-based and dense within a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based citation number as it appears in the answer text.
    pub number: usize,
    /// Source the cited chunk belongs to.
    pub source_id: String,
    /// Snippet of the cited chunk text.
    pub snippet: String,
}

impl Citation {
    /// Creates a citation, truncating the snippet to a display-friendly size.
    #[must_use]
    pub fn new(number: usize, source_id: &str, text: &str) -> Self {
        let snippet = if text.len() > 300 {
            let mut end = 300;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &text[..end])
        } else {
            text.to_string()
        };
        Self {
            number,
            source_id: source_id.to_string(),
            snippet,
        }
    }
}

/// A web source attached to a response when the web fallback engaged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSource {
    /// Result title.
    pub title: String,
    /// Result URL.
    pub url: String,
    /// Whether the full page was scraped or only the snippet used.
    pub scraped: bool,
}
