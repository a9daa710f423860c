//! Source representation.
//!
//! A source is one ingested document of any kind, owned by exactly one
//! notebook. Ingestion status moves `pending -> processing -> completed`
//! (or `failed` with a bounded reason string).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Normalized source kind.
///
/// Replaces the stringly-typed routing of earlier prototypes with a tagged
/// sum matched at the chunker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// PDF document.
    Pdf,
    /// Word-processor document (docx, doc, pptx).
    Doc,
    /// Captured web page.
    Web,
    /// YouTube transcript capture.
    Youtube,
    /// Spreadsheet (xlsx, xls, csv).
    Spreadsheet,
    /// Meeting or call transcript.
    Transcript,
    /// User text selection.
    Selection,
    /// Person/company profile document.
    Profile,
    /// Free-form note.
    Note,
}

impl SourceKind {
    /// Parses a kind from its wire string, defaulting to `Note`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pdf" => Self::Pdf,
            "doc" | "docx" | "pptx" | "document" => Self::Doc,
            "web" | "html" | "url" => Self::Web,
            "youtube" => Self::Youtube,
            "spreadsheet" | "xlsx" | "xls" | "csv" | "tabular" => Self::Spreadsheet,
            "transcript" => Self::Transcript,
            "selection" => Self::Selection,
            "profile" => Self::Profile,
            _ => Self::Note,
        }
    }

    /// Wire string for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Doc => "doc",
            Self::Web => "web",
            Self::Youtube => "youtube",
            Self::Spreadsheet => "spreadsheet",
            Self::Transcript => "transcript",
            Self::Selection => "selection",
            Self::Profile => "profile",
            Self::Note => "note",
        }
    }

    /// Whether this kind holds row-oriented tabular data.
    #[must_use]
    pub const fn is_tabular(self) -> bool {
        matches!(self, Self::Spreadsheet)
    }

    /// Whether this kind is a structured document (sections, headers).
    #[must_use]
    pub const fn is_structured_doc(self) -> bool {
        matches!(self, Self::Pdf | Self::Doc)
    }
}

/// Ingestion status of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// Accepted, not yet processed.
    Pending,
    /// Ingestion in flight.
    Processing,
    /// Fully indexed.
    Completed,
    /// Ingestion failed; `error` holds the reason.
    Failed,
}

/// One ingested document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Source identifier.
    pub id: String,
    /// Owning notebook.
    pub notebook_id: String,
    /// Display name (usually the filename).
    pub title: String,
    /// Extracted text content. May be empty for externally-stored bodies.
    #[serde(default)]
    pub content: String,
    /// Normalized kind.
    pub kind: SourceKind,
    /// Origin URL if any.
    #[serde(default)]
    pub url: Option<String>,
    /// Ingestion status.
    pub status: SourceStatus,
    /// Number of chunks produced by the last successful ingest.
    #[serde(default)]
    pub chunk_count: usize,
    /// Normalized tags (lowercase, trimmed, deduped).
    #[serde(default)]
    pub tags: Vec<String>,
    /// Failure reason when `status == Failed` (<= 200 chars).
    #[serde(default)]
    pub error: Option<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// Creates a new pending source.
    #[must_use]
    pub fn new(id: &str, notebook_id: &str, title: &str, kind: SourceKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            notebook_id: notebook_id.to_string(),
            title: title.to_string(),
            content: String::new(),
            kind,
            url: None,
            status: SourceStatus::Pending,
            chunk_count: 0,
            tags: Vec::new(),
            error: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replaces the tag set with a normalized copy of `tags`.
    pub fn set_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = normalize_tags(tags);
        self.updated_at = Utc::now();
    }

    /// Adds a single tag if not already present (case-insensitive).
    pub fn add_tag(&mut self, tag: &str) {
        let normalized = tag.trim().to_lowercase();
        if !normalized.is_empty() && !self.tags.contains(&normalized) {
            self.tags.push(normalized);
            self.updated_at = Utc::now();
        }
    }

    /// Removes a tag (case-insensitive).
    pub fn remove_tag(&mut self, tag: &str) {
        let normalized = tag.trim().to_lowercase();
        self.tags.retain(|t| *t != normalized);
        self.updated_at = Utc::now();
    }
}

/// Normalizes a tag collection: lowercase, trim, drop empties, dedupe
/// preserving first-seen order.
#[must_use]
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for tag in tags {
        let normalized = tag.as_ref().trim().to_lowercase();
        if !normalized.is_empty() && seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("pdf", SourceKind::Pdf)]
    #[test_case("XLSX", SourceKind::Spreadsheet)]
    #[test_case("csv", SourceKind::Spreadsheet)]
    #[test_case("docx", SourceKind::Doc)]
    #[test_case("web", SourceKind::Web)]
    #[test_case("something-else", SourceKind::Note)]
    fn test_kind_parse(input: &str, expected: SourceKind) {
        assert_eq!(SourceKind::parse(input), expected);
    }

    #[test]
    fn test_kind_predicates() {
        assert!(SourceKind::Spreadsheet.is_tabular());
        assert!(!SourceKind::Pdf.is_tabular());
        assert!(SourceKind::Pdf.is_structured_doc());
        assert!(!SourceKind::Web.is_structured_doc());
    }

    #[test]
    fn test_normalize_tags() {
        let tags = normalize_tags(["  Finance ", "finance", "Q1", "", "q1", "Strategy"]);
        assert_eq!(tags, vec!["finance", "q1", "strategy"]);
    }

    #[test]
    fn test_set_tags_round_trip() {
        let mut source = Source::new("s1", "n1", "doc.pdf", SourceKind::Pdf);
        source.set_tags(["Alpha", "BETA", "alpha"]);
        assert_eq!(source.tags, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_add_remove_tag() {
        let mut source = Source::new("s1", "n1", "doc.pdf", SourceKind::Pdf);
        source.add_tag("Revenue");
        source.add_tag("revenue");
        assert_eq!(source.tags, vec!["revenue"]);
        source.remove_tag("REVENUE");
        assert!(source.tags.is_empty());
    }

    #[test]
    fn test_new_source_is_pending() {
        let source = Source::new("s1", "n1", "doc.pdf", SourceKind::Pdf);
        assert_eq!(source.status, SourceStatus::Pending);
        assert_eq!(source.chunk_count, 0);
    }
}
