//! Tabular data chunking.
//!
//! Spreadsheet extractions arrive as row-oriented text. Rows are grouped
//! into chunks bounded by the character budget, and the sheet's header
//! context is re-prepended to every chunk so each one is self-sufficient
//! for retrieval.

/// Maximum header lines preserved as per-chunk context.
const MAX_HEADER_LINES: usize = 5;

/// Chunks row-oriented tabular text.
///
/// Returns `None` when no usable rows were found, signalling the caller to
/// fall back to standard chunking.
#[must_use]
pub fn chunk_tabular(text: &str, max_chunk_chars: usize) -> Option<Vec<String>> {
    let mut header_lines: Vec<&str> = Vec::new();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }
        if is_header_line(stripped) {
            header_lines.push(stripped);
        } else {
            data_lines.push(stripped);
        }
    }

    let header_context = header_lines
        .iter()
        .take(MAX_HEADER_LINES)
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    let header_len = header_context.len() + 2;

    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = header_len;

    for line in &data_lines {
        let line_len = line.len() + 1;
        if current_len + line_len > max_chunk_chars && !current.is_empty() {
            chunks.push(assemble(&header_context, &current));
            current = vec![line];
            current_len = header_len + line_len;
        } else {
            current.push(line);
            current_len += line_len;
        }
    }

    if !current.is_empty() {
        let chunk = assemble(&header_context, &current);
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
    }

    if chunks.is_empty() { None } else { Some(chunks) }
}

/// Sheet-header heuristic: separator bars, sheet banners, and the
/// column-definition row emitted by the spreadsheet extractor.
fn is_header_line(line: &str) -> bool {
    line.starts_with("===")
        || line.starts_with("Data from sheet")
        || line.starts_with("Complete row data")
        || line.starts_with("This data is from")
        || (line.starts_with("Row 1:") && line.contains("Column") && line.contains(':'))
}

fn assemble(header: &str, rows: &[&str]) -> String {
    if header.is_empty() {
        rows.join("\n")
    } else {
        format!("{}\n\n{}", header, rows.join("\n"))
    }
}

/// Heuristic for detecting row-oriented text regardless of declared kind.
///
/// Looks for `Row k:` markers in the first 500 characters.
#[must_use]
pub fn looks_tabular(text: &str) -> bool {
    let head_end = crate::chunking::semantic::floor_char_boundary(text, text.len().min(500));
    let head = &text[..head_end];
    head.contains("Row ") && head.contains(": ")
}
