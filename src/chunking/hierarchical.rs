//! Hierarchical chunking for structured documents.
//!
//! Creates chunks at document, section, and paragraph levels (sentence level
//! on request) so retrieval can happen at the granularity a query needs.
//! Section boundaries are detected from markdown headers, `Title:` lines,
//! numbered sections, page markers, and ALL-CAPS headers.

use crate::core::{ChunkDraft, ChunkLevel};
use regex::Regex;
use std::sync::LazyLock;

/// Target sizes per hierarchy level, in characters.
pub const DOCUMENT_CHUNK_CHARS: usize = 4000;
/// Section chunk budget.
pub const SECTION_CHUNK_CHARS: usize = 1500;
/// Paragraph chunk budget.
pub const PARAGRAPH_CHUNK_CHARS: usize = 500;
/// Minimum paragraph size before merging with a neighbor.
pub const PARAGRAPH_MIN_CHARS: usize = 100;

// Pattern literals, exercised by the tests below.
static SECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^#{1,3}\s+(.+)$",          // Markdown headers
        r"^([A-Z][A-Za-z\s]+):$",    // Title: format
        r"^\d+\.\s+([A-Z].+)$",      // Numbered sections
        r"^===\s*Page\s+\d+\s*===$", // PDF page markers
        r"^[A-Z][A-Z\s]{5,50}$",     // ALL CAPS headers
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

#[allow(clippy::unwrap_used)]
static PARAGRAPH_SPLIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

/// Hierarchical chunker for structured documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchicalChunker;

impl HierarchicalChunker {
    /// Creates a hierarchical chunker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Produces the full chunk hierarchy for a document.
    ///
    /// Level order in the output: one document chunk, then for each section a
    /// section chunk followed by its paragraph chunks (and sentence chunks
    /// when `include_sentences` is set).
    #[must_use]
    pub fn chunk_document(
        &self,
        text: &str,
        source_id: &str,
        filename: &str,
        include_sentences: bool,
    ) -> Vec<ChunkDraft> {
        let mut chunks = Vec::new();

        let doc_id = format!("{source_id}_doc");
        let mut doc_summary =
            text[..crate::chunking::semantic::floor_char_boundary(text, DOCUMENT_CHUNK_CHARS)]
                .to_string();
        if text.len() > DOCUMENT_CHUNK_CHARS {
            doc_summary.push_str("...");
        }
        chunks.push(ChunkDraft::new(
            doc_id.clone(),
            doc_summary,
            ChunkLevel::Document,
            None,
            if filename.is_empty() {
                "Document Overview".to_string()
            } else {
                filename.to_string()
            },
            0,
        ));

        for (section_idx, (section_title, section_content)) in
            detect_sections(text).into_iter().enumerate()
        {
            if section_content.trim().is_empty() {
                continue;
            }

            let section_id = format!("{source_id}_s{section_idx}");
            let section_text = section_content[..crate::chunking::semantic::floor_char_boundary(
                &section_content,
                SECTION_CHUNK_CHARS,
            )]
                .to_string();
            chunks.push(ChunkDraft::new(
                section_id.clone(),
                section_text,
                ChunkLevel::Section,
                Some(doc_id.clone()),
                section_title.clone(),
                section_idx,
            ));

            let paragraphs = merge_small(
                split_paragraphs(&section_content),
                PARAGRAPH_MIN_CHARS,
                PARAGRAPH_CHUNK_CHARS,
            );

            for (para_idx, para_text) in paragraphs.into_iter().enumerate() {
                if para_text.len() < 50 {
                    continue;
                }

                let para_id = format!("{source_id}_s{section_idx}_p{para_idx}");
                if include_sentences && para_text.len() > 200 {
                    for (sent_idx, sentence) in
                        crate::chunking::semantic::split_sentences(&para_text)
                            .into_iter()
                            .filter(|s| s.len() >= 30)
                            .enumerate()
                    {
                        chunks.push(ChunkDraft::new(
                            format!("{para_id}_t{sent_idx}"),
                            sentence.to_string(),
                            ChunkLevel::Sentence,
                            Some(para_id.clone()),
                            section_title.clone(),
                            sent_idx,
                        ));
                    }
                }

                chunks.push(ChunkDraft::new(
                    para_id,
                    para_text,
                    ChunkLevel::Paragraph,
                    Some(section_id.clone()),
                    section_title.clone(),
                    para_idx,
                ));
            }
        }

        chunks
    }
}

/// Detects section boundaries, returning `(title, content)` pairs.
///
/// Content before the first header lands in an "Introduction" section.
#[must_use]
pub fn detect_sections(text: &str) -> Vec<(String, String)> {
    let mut sections = Vec::new();
    let mut current_title = "Introduction".to_string();
    let mut current_content: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        let header = SECTION_PATTERNS.iter().find_map(|pattern| {
            pattern.captures(trimmed).map(|caps| {
                caps.get(1)
                    .map_or_else(|| trimmed.to_string(), |m| m.as_str().to_string())
            })
        });

        if let Some(header_text) = header {
            if !current_content.is_empty() {
                sections.push((current_title.clone(), current_content.join("\n")));
            }
            current_title = header_text;
            current_content = Vec::new();
        } else {
            current_content.push(line);
        }
    }

    if !current_content.is_empty() {
        sections.push((current_title, current_content.join("\n")));
    }

    sections
}

fn split_paragraphs(text: &str) -> Vec<String> {
    PARAGRAPH_SPLIT
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Merges undersized chunks forward until they reach `min_size`, without
/// exceeding `max_size`.
fn merge_small(chunks: Vec<String>, min_size: usize, max_size: usize) -> Vec<String> {
    let mut iter = chunks.into_iter();
    let Some(mut current) = iter.next() else {
        return Vec::new();
    };

    let mut merged = Vec::new();
    for chunk in iter {
        if current.len() < min_size && current.len() + chunk.len() < max_size {
            current.push_str("\n\n");
            current.push_str(&chunk);
        } else {
            if !current.trim().is_empty() {
                merged.push(current.trim().to_string());
            }
            current = chunk;
        }
    }
    if !current.trim().is_empty() {
        merged.push(current.trim().to_string());
    }

    merged
}
