//! Response normalisation: turn generated text into a single JSON record.
//!
//! Models asked for JSON still produce a handful of predictable variations:
//!
//! - Wrapping the payload in ` ```json ... ``` ` fences despite the response
//!   MIME type asking for raw JSON
//! - Returning `[{...}]` when a single object was requested
//! - Returning nothing at all when the content filter intervenes
//!
//! [`parse_model_json`] applies a short, ordered list of rules that absorb
//! those variations and rejects everything else with a [`NormalizeError`].
//! Storage expects exactly one object per document, so arrays of several
//! records and bare scalars are rejected rather than guessed at.
//!
//! ## Rule Order
//!
//! 1. Reject empty / whitespace-only text
//! 2. Strip the opening fence line, and the closing one when it is the last line
//! 3. Parse as JSON
//! 4. Unwrap a non-empty array to its first element
//! 5. Require an object

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::borrow::Cow;
use thiserror::Error;

/// Why generated text could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("model returned an empty response")]
    Empty,

    #[error("model output is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("model output is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

/// Parse model output into a JSON object.
///
/// ```rust
/// use docintake::pipeline::normalize::parse_model_json;
///
/// let record = parse_model_json("```json\n{\"invoice\": \"A-17\"}\n```").unwrap();
/// assert_eq!(record["invoice"], "A-17");
/// ```
pub fn parse_model_json(raw: &str) -> Result<Map<String, Value>, NormalizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizeError::Empty);
    }

    let body = strip_code_fence(trimmed);
    let value: Value = serde_json::from_str(body.trim())
        .map_err(|e| NormalizeError::InvalidJson(e.to_string()))?;

    match unwrap_single_element(value) {
        Value::Object(map) => Ok(map),
        other => Err(NormalizeError::NotAnObject(json_kind(&other))),
    }
}

// ── Rule 2: Strip code fences ────────────────────────────────────────────────

// Opening fence with an optional language tag: ```json, ```JSON, ```
static RE_OPENING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```[A-Za-z0-9_+\-]*\s*$").unwrap());

fn strip_code_fence(text: &str) -> Cow<'_, str> {
    let lines: Vec<&str> = text.lines().collect();
    match lines.first() {
        Some(first) if RE_OPENING_FENCE.is_match(first) => {}
        _ => return Cow::Borrowed(text),
    }

    let closed = lines.len() > 2 && lines.last().map(|l| l.trim()) == Some("```");
    let end = if closed { lines.len() - 1 } else { lines.len() };
    Cow::Owned(lines[1..end].join("\n"))
}

// ── Rule 4: Unwrap list-wrapped records ──────────────────────────────────────

fn unwrap_single_element(value: Value) -> Value {
    match value {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
