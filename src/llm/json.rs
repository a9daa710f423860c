//! JSON extraction from LLM output.
//!
//! Models wrap JSON in prose, code fences, or partial noise. This utility
//! applies three strategies in a fixed order and returns the first parse
//! that succeeds:
//!
//! 1. Direct parse of the trimmed text.
//! 2. Contents of a fenced code block.
//! 3. The first balanced `{...}` or `[...]` span.

use crate::error::{DependencyError, Result};
use serde_json::Value;

/// Extracts a JSON value from raw model output.
///
/// # Errors
///
/// Returns [`DependencyError::Misbehaving`] when no strategy yields valid
/// JSON.
pub fn extract_json(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();

    // Strategy 1: direct parse
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    // Strategy 2: fenced code block
    if let Some(fenced) = extract_fenced(trimmed)
        && let Ok(value) = serde_json::from_str::<Value>(fenced.trim())
    {
        return Ok(value);
    }

    // Strategy 3: balanced braces/brackets
    if let Some(span) = extract_balanced(trimmed)
        && let Ok(value) = serde_json::from_str::<Value>(span)
    {
        return Ok(value);
    }

    Err(DependencyError::Misbehaving {
        name: "llm".to_string(),
        reason: format!("no parseable JSON in output: {}", preview(trimmed)),
    }
    .into())
}

/// Extracts a JSON array of strings, the common shape for decomposition
/// and tagging calls.
///
/// # Errors
///
/// Returns [`DependencyError::Misbehaving`] when the output is not a
/// string array.
pub fn extract_string_array(raw: &str) -> Result<Vec<String>> {
    let value = extract_json(raw)?;
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect::<Vec<String>>()
        })
        .ok_or_else(|| {
            DependencyError::Misbehaving {
                name: "llm".to_string(),
                reason: "expected a JSON array of strings".to_string(),
            }
            .into()
        })
}

fn extract_fenced(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Skip an optional language tag on the fence line
    let body_start = after_fence.find('\n').map_or(0, |nl| nl + 1);
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// Finds the first balanced `{...}` or `[...]` span, string-aware.
fn extract_balanced(text: &str) -> Option<&str> {
    let open_pos = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let open = bytes[open_pos];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[open_pos..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            _ if in_string => {}
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open_pos..=open_pos + offset]);
                }
            }
            _ => {}
        }
    }

    None
}

fn preview(text: &str) -> String {
    let end = crate::chunking::semantic::floor_char_boundary(text, text.len().min(120));
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_parse() {
        let value = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_fenced_block() {
        let raw = "Here you go:\n```json\n{\"tags\": [\"x\"]}\n```\nDone.";
        let value = extract_json(raw).unwrap();
        assert_eq!(value["tags"][0], "x");
    }

    #[test]
    fn test_fenced_block_no_language() {
        let raw = "```\n[1, 2, 3]\n```";
        let value = extract_json(raw).unwrap();
        assert_eq!(value[2], 3);
    }

    #[test]
    fn test_balanced_in_prose() {
        let raw = r#"Sure! The entities are [{"name": "Chris", "type": "person"}] as requested."#;
        let value = extract_json(raw).unwrap();
        assert_eq!(value[0]["name"], "Chris");
    }

    #[test]
    fn test_balanced_nested() {
        let raw = r#"prefix {"outer": {"inner": [1, 2]}} suffix"#;
        let value = extract_json(raw).unwrap();
        assert_eq!(value["outer"]["inner"][1], 2);
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let raw = r#"noise {"text": "a } inside"} trailing"#;
        let value = extract_json(raw).unwrap();
        assert_eq!(value["text"], "a } inside");
    }

    #[test]
    fn test_garbage_is_error() {
        let err = extract_json("no json anywhere").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Dependency(DependencyError::Misbehaving { .. })
        ));
    }

    #[test]
    fn test_string_array() {
        let strings = extract_string_array(r#"["one", "two"]"#).unwrap();
        assert_eq!(strings, vec!["one", "two"]);
    }

    #[test]
    fn test_string_array_empty_ok() {
        assert!(extract_string_array("[]").unwrap().is_empty());
    }

    #[test]
    fn test_string_array_wrong_shape() {
        assert!(extract_string_array(r#"{"a": 1}"#).is_err());
    }
}
