//! JSON extraction from model replies.
//!
//! Chat models often wrap the JSON they were asked for in prose or in a
//! markdown code fence. The helpers here pull the object back out:
//!
//! 1. A fenced block (```` ```json ```` or a bare fence) is searched first.
//! 2. Otherwise the span from the first `{` to its matching `}` is tried.
//! 3. As a last resort the span from the first `{` to the last `}` is used.
//!
//! A candidate is only returned if it parses as JSON.

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Error type for JSON extraction failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("No JSON object found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },

    #[error("JSON object could not be decoded: {0}")]
    Invalid(String),
}

/// Returns the first JSON object embedded in `content`, if any.
pub fn extract_json_object(content: &str) -> Option<&str> {
    let trimmed = content.trim();

    if let Some(block) = fenced_block(trimmed) {
        if let Some(json) = balanced_object(block) {
            return Some(json);
        }
    }

    if let Some(json) = balanced_object(trimmed) {
        return Some(json);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &trimmed[start..=end];
    is_json(candidate).then_some(candidate)
}

/// Extracts and deserializes the first JSON object in `content`.
pub fn parse_json_object<T: DeserializeOwned>(content: &str) -> Result<T, JsonExtractionError> {
    let json = extract_json_object(content).ok_or_else(|| JsonExtractionError::NotFound {
        content_preview: truncate_chars(content.trim(), 50),
    })?;
    serde_json::from_str(json).map_err(|e| JsonExtractionError::Invalid(e.to_string()))
}

/// Index of the `}` matching the `{` that `s` starts with.
///
/// Braces inside string literals, including escaped quotes, are ignored.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// First `limit` characters of `s`, never splitting a code point.
pub fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

fn fenced_block(content: &str) -> Option<&str> {
    let open = content.find("```")?;
    let after_fence = &content[open + 3..];
    // Skip the language tag, if any.
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

fn balanced_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = find_matching_brace(&content[start..])?;
    let candidate = &content[start..=start + end];
    is_json(candidate).then_some(candidate)
}

fn is_json(candidate: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(candidate).is_ok()
}
