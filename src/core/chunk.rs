//! Chunk representation.
//!
//! Chunks exist at four granularities. Levels below `Document` always have
//! a parent. Identifiers are derived from the source id plus position so
//! re-ingesting a source produces stable ids.

use serde::{Deserialize, Serialize};

/// Granularity of a chunk in the document hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkLevel {
    /// Whole-document summary slice.
    Document,
    /// Section-level chunk.
    Section,
    /// Paragraph-level chunk (the default retrieval unit).
    Paragraph,
    /// Sentence-level chunk (produced only on request).
    Sentence,
}

impl ChunkLevel {
    /// Wire string for this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Section => "section",
            Self::Paragraph => "paragraph",
            Self::Sentence => "sentence",
        }
    }

    /// Parses a level from its wire string, defaulting to `Paragraph`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "document" => Self::Document,
            "section" => Self::Section,
            "sentence" => Self::Sentence,
            _ => Self::Paragraph,
        }
    }
}

/// A chunk produced by the chunker, before embedding and indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDraft {
    /// Derived chunk id (`{source}_s{i}`, `{source}_s{i}_p{j}`, ...).
    pub chunk_id: String,
    /// Chunk text.
    pub text: String,
    /// Hierarchy level.
    pub level: ChunkLevel,
    /// Parent chunk id. `None` only for `Document`-level chunks.
    pub parent_id: Option<String>,
    /// Title of the enclosing section, when detected.
    pub section_title: String,
    /// Position within the parent (0-based).
    pub position: usize,
}

impl ChunkDraft {
    /// Creates a draft with a derived id.
    #[must_use]
    pub fn new(
        chunk_id: String,
        text: String,
        level: ChunkLevel,
        parent_id: Option<String>,
        section_title: String,
        position: usize,
    ) -> Self {
        Self {
            chunk_id,
            text,
            level,
            parent_id,
            section_title,
            position,
        }
    }
}

/// A fully materialized chunk row as stored in the hybrid index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Derived chunk id.
    pub chunk_id: String,
    /// Owning source.
    pub source_id: String,
    /// Owning notebook.
    pub notebook_id: String,
    /// Chunk text.
    pub text: String,
    /// Hierarchy level.
    pub level: ChunkLevel,
    /// Parent chunk id, if any.
    pub parent_id: Option<String>,
    /// Section title, if detected.
    pub section_title: String,
    /// Position within the parent.
    pub position: usize,
    /// Originating filename.
    pub filename: String,
    /// Pre-expanded parent context text, if computed at ingest time.
    pub parent_text: Option<String>,
    /// Dense embedding vector of fixed dimension.
    pub vector: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_round_trip() {
        for level in [
            ChunkLevel::Document,
            ChunkLevel::Section,
            ChunkLevel::Paragraph,
            ChunkLevel::Sentence,
        ] {
            assert_eq!(ChunkLevel::parse(level.as_str()), level);
        }
    }

    #[test]
    fn test_level_ordering() {
        assert!(ChunkLevel::Document < ChunkLevel::Section);
        assert!(ChunkLevel::Section < ChunkLevel::Paragraph);
    }
}
