//! Standard semantic chunking.
//!
//! Splits on blank lines first, then sentence boundaries, then characters,
//! targeting the configured chunk size with overlap carried from the tail of
//! each chunk into the next. Boundary-aware splits produce more coherent
//! chunks for embedding than fixed-width slicing.

use unicode_segmentation::UnicodeSegmentation;

/// Minimum chunk size; trailing fragments below this merge into a neighbor.
pub const MIN_CHUNK_CHARS: usize = 50;

/// Chunks text with semantic boundary awareness.
///
/// Guarantees at least one chunk for any input with non-whitespace content,
/// and that the concatenation of chunks covers every non-whitespace
/// character of the input (overlap may duplicate characters).
#[must_use]
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut paragraphs: Vec<&str> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if paragraphs.is_empty() {
        paragraphs = text
            .split('\n')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in paragraphs {
        if current.len() + para.len() + 2 > chunk_size {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }

            if para.len() > chunk_size {
                // Oversized paragraph: fall back to sentences, then chars
                for sentence in split_sentences(para) {
                    if current.len() + sentence.len() + 1 > chunk_size {
                        if !current.is_empty() {
                            chunks.push(std::mem::take(&mut current));
                        }
                        if sentence.len() > chunk_size {
                            chunks.extend(char_split(sentence, chunk_size, overlap));
                        } else {
                            current = sentence.to_string();
                        }
                    } else if current.is_empty() {
                        current = sentence.to_string();
                    } else {
                        current.push(' ');
                        current.push_str(sentence);
                    }
                }
            } else {
                current = para.to_string();
            }
        } else if current.is_empty() {
            current = para.to_string();
        } else {
            current.push_str("\n\n");
            current.push_str(para);
        }
    }

    if !current.is_empty() {
        // Merge a tiny trailing fragment into the previous chunk
        if current.len() < MIN_CHUNK_CHARS
            && let Some(last) = chunks.last_mut()
        {
            last.push('\n');
            last.push_str(&current);
        } else {
            chunks.push(current);
        }
    }

    if chunks.is_empty() {
        return Vec::new();
    }

    apply_overlap(chunks, overlap)
}

/// Carries the tail of chunk k into the head of chunk k+1.
fn apply_overlap(chunks: Vec<String>, overlap: usize) -> Vec<String> {
    if overlap == 0 || chunks.len() < 2 {
        return chunks;
    }

    let mut out = Vec::with_capacity(chunks.len());
    out.push(chunks[0].clone());
    for i in 1..chunks.len() {
        let prev = &chunks[i - 1];
        let tail_start = floor_char_boundary(prev, prev.len().saturating_sub(overlap));
        out.push(format!("{}\n{}", &prev[tail_start..], chunks[i]));
    }
    out
}

/// Splits text into sentences using Unicode segmentation rules.
#[must_use]
pub fn split_sentences(text: &str) -> Vec<&str> {
    text.split_sentence_bounds()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Character-based splitting for text with no usable boundaries.
#[must_use]
pub fn char_split(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let end = floor_char_boundary(text, (start + chunk_size).min(text.len()));
        chunks.push(text[start..end].to_string());
        if end == text.len() {
            break;
        }
        let mut next = floor_char_boundary(text, start + step);
        if next <= start {
            // Step landed inside a multibyte char; advance to the next boundary
            next = (start + 1..=text.len())
                .find(|&i| text.is_char_boundary(i))
                .unwrap_or(text.len());
        }
        start = next;
    }

    chunks
}

/// Snaps a byte position down to the nearest UTF-8 character boundary.
#[must_use]
pub fn floor_char_boundary(text: &str, mut pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}
