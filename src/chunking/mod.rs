//! Smart chunking.
//!
//! Routes text to a chunking strategy by source kind:
//!
//! - Tabular sources keep rows together with header context re-prepended.
//! - Structured documents over 2000 chars get hierarchical section and
//!   paragraph chunks.
//! - Everything else gets standard semantic chunking with overlap.
//!
//! The chunker never loses non-whitespace characters and produces at least
//! one chunk for any non-empty input.

pub mod hierarchical;
pub mod semantic;
pub mod tabular;

pub use hierarchical::HierarchicalChunker;

use crate::core::{ChunkDraft, ChunkLevel, SourceKind};
use tracing::debug;

/// Maximum characters of parent context assembled around a chunk.
pub const MAX_PARENT_CHARS: usize = 2000;

/// Structured documents shorter than this skip the hierarchical path.
const HIERARCHICAL_MIN_CHARS: usize = 2000;

/// Adaptive chunker routing by source kind.
///
/// # Examples
///
/// ```
/// use carrel::chunking::SmartChunker;
/// use carrel::core::SourceKind;
///
/// let chunker = SmartChunker::new(1000, 100);
/// let drafts = chunker.chunk("Some note text.", SourceKind::Note, "s1", "note.txt");
/// assert_eq!(drafts.len(), 1);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SmartChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl SmartChunker {
    /// Creates a chunker with the given size and overlap targets.
    #[must_use]
    pub const fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    /// Chunks text adaptively, returning retrieval-ready drafts.
    ///
    /// Hierarchical output is filtered to section and paragraph levels;
    /// sentence-level chunks come from
    /// [`HierarchicalChunker::chunk_document`] directly when needed.
    #[must_use]
    pub fn chunk(
        &self,
        text: &str,
        kind: SourceKind,
        source_id: &str,
        filename: &str,
    ) -> Vec<ChunkDraft> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let filename_lower = filename.to_lowercase();

        let is_tabular = kind.is_tabular()
            || filename_lower.ends_with(".xlsx")
            || filename_lower.ends_with(".xls")
            || filename_lower.ends_with(".csv")
            || tabular::looks_tabular(text);

        if is_tabular {
            if let Some(chunks) = tabular::chunk_tabular(text, self.chunk_size) {
                debug!(chunks = chunks.len(), source_id, "tabular chunking");
                return Self::flat_drafts(chunks, source_id);
            }
            // Header/row detection found nothing usable; treat as prose
        }

        let is_structured = kind.is_structured_doc()
            || filename_lower.ends_with(".pdf")
            || filename_lower.ends_with(".docx")
            || filename_lower.ends_with(".doc")
            || filename_lower.ends_with(".pptx");

        if is_structured && text.len() > HIERARCHICAL_MIN_CHARS {
            let drafts = self.chunk_hierarchical(text, source_id, filename);
            if !drafts.is_empty() {
                return drafts;
            }
            debug!(source_id, "hierarchical chunking produced nothing, falling back");
        }

        let chunks = semantic::chunk_text(text, self.chunk_size, self.chunk_overlap);
        Self::flat_drafts(chunks, source_id)
    }

    /// Hierarchical path: section chunks plus paragraph chunks with the
    /// section title prepended, keeping only chunks of useful size.
    fn chunk_hierarchical(&self, text: &str, source_id: &str, filename: &str) -> Vec<ChunkDraft> {
        let all = HierarchicalChunker::new().chunk_document(text, source_id, filename, false);

        let mut drafts: Vec<ChunkDraft> = Vec::new();
        for mut chunk in all {
            match chunk.level {
                ChunkLevel::Section => {}
                ChunkLevel::Paragraph => {
                    if !chunk.section_title.is_empty() {
                        chunk.text = format!("[{}]\n{}", chunk.section_title, chunk.text);
                    }
                }
                _ => continue,
            }
            if chunk.text.len() >= 100 {
                drafts.push(chunk);
            }
        }

        debug!(chunks = drafts.len(), source_id, "hierarchical chunking");
        drafts
    }

    /// Wraps flat chunk texts into paragraph-level drafts under a synthetic
    /// document parent id.
    fn flat_drafts(chunks: Vec<String>, source_id: &str) -> Vec<ChunkDraft> {
        let parent = format!("{source_id}_doc");
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                ChunkDraft::new(
                    format!("{source_id}_c{i}"),
                    text,
                    ChunkLevel::Paragraph,
                    Some(parent.clone()),
                    String::new(),
                    i,
                )
            })
            .collect()
    }
}

/// Assembles expanded parent context for the chunk at `index`.
///
/// Concatenates the chunk with neighbors (preceding first, then following),
/// truncating at the outer edges once `max_parent_chars` is reached.
#[must_use]
pub fn parent_context(chunks: &[String], index: usize, max_parent_chars: usize) -> String {
    let Some(current) = chunks.get(index) else {
        return String::new();
    };

    let mut parts: std::collections::VecDeque<String> =
        std::collections::VecDeque::from([current.clone()]);
    let mut total = current.len();

    // Preceding neighbors
    let mut prev = index;
    while prev > 0 && total < max_parent_chars {
        prev -= 1;
        let neighbor = &chunks[prev];
        if total + neighbor.len() > max_parent_chars {
            let remaining = max_parent_chars - total;
            let start =
                semantic::floor_char_boundary(neighbor, neighbor.len().saturating_sub(remaining));
            parts.push_front(format!("{}...", &neighbor[start..]));
            break;
        }
        total += neighbor.len();
        parts.push_front(neighbor.clone());
    }

    // Following neighbors
    let mut next = index + 1;
    while next < chunks.len() && total < max_parent_chars {
        let neighbor = &chunks[next];
        if total + neighbor.len() > max_parent_chars {
            let remaining = max_parent_chars - total;
            let end = semantic::floor_char_boundary(neighbor, remaining);
            parts.push_back(format!("...{}", &neighbor[..end]));
            break;
        }
        total += neighbor.len();
        parts.push_back(neighbor.clone());
        next += 1;
    }

    parts.into_iter().collect::<Vec<_>>().join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_spreadsheet_to_tabular() {
        let chunker = SmartChunker::new(1000, 100);
        let text = "=== Sheet ===\nRow 1: Column A: Name\nRow 2: Name: Alice\nRow 3: Name: Bob\n";
        let drafts = chunker.chunk(text, SourceKind::Spreadsheet, "s1", "data.xlsx");
        assert!(!drafts.is_empty());
        assert!(drafts[0].text.contains("=== Sheet ==="));
    }

    #[test]
    fn test_routes_by_extension() {
        let chunker = SmartChunker::new(1000, 100);
        let text = "Row 1: Column A: X\nRow 2: X: 1\n";
        let drafts = chunker.chunk(text, SourceKind::Note, "s1", "export.CSV");
        assert!(drafts[0].text.contains("Row 2"));
    }

    #[test]
    fn test_routes_pdf_to_hierarchical() {
        let chunker = SmartChunker::new(1000, 100);
        let body = "This paragraph talks about results in some depth over multiple sentences of prose. "
            .repeat(3);
        let text = format!("# Alpha\n\n{body}\n\n# Beta\n\n{body}\n\n{body}");
        assert!(text.len() > 2000);
        let drafts = chunker.chunk(&text, SourceKind::Pdf, "s1", "r.pdf");
        assert!(drafts.iter().any(|d| d.level == ChunkLevel::Section));
        // Paragraph chunks carry their section context
        assert!(
            drafts
                .iter()
                .filter(|d| d.level == ChunkLevel::Paragraph)
                .all(|d| d.text.starts_with('['))
        );
    }

    #[test]
    fn test_short_pdf_uses_semantic() {
        let chunker = SmartChunker::new(1000, 100);
        let drafts = chunker.chunk("Short pdf body.", SourceKind::Pdf, "s1", "r.pdf");
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].level, ChunkLevel::Paragraph);
    }

    #[test]
    fn test_empty_text_no_chunks() {
        let chunker = SmartChunker::new(1000, 100);
        assert!(chunker.chunk("  \n ", SourceKind::Note, "s1", "n.txt").is_empty());
    }

    #[test]
    fn test_flat_drafts_have_parents() {
        let chunker = SmartChunker::new(100, 10);
        let text = "para one here.\n\npara two here.\n\npara three goes on a bit longer than the others.";
        let drafts = chunker.chunk(text, SourceKind::Note, "s1", "n.txt");
        for draft in &drafts {
            assert_eq!(draft.parent_id.as_deref(), Some("s1_doc"));
        }
    }

    #[test]
    fn test_parent_context_includes_neighbors() {
        let chunks = vec![
            "first".to_string(),
            "second".to_string(),
            "third".to_string(),
        ];
        let ctx = parent_context(&chunks, 1, 2000);
        assert_eq!(ctx, "first\n\nsecond\n\nthird");
    }

    #[test]
    fn test_parent_context_truncates_edges() {
        let chunks = vec!["a".repeat(900), "b".repeat(300), "c".repeat(900)];
        let ctx = parent_context(&chunks, 1, 1000);
        assert!(ctx.len() <= 1000 + 10);
        assert!(ctx.contains(&"b".repeat(300)));
    }

    #[test]
    fn test_parent_context_out_of_range() {
        assert!(parent_context(&[], 0, 1000).is_empty());
        assert!(parent_context(&["x".to_string()], 5, 1000).is_empty());
    }
}
