//! Input sanitizing for client-supplied strings and config maps.
//!
//! Every string that reaches storage or a shell-adjacent layer passes
//! through here first: markup is stripped, control characters removed,
//! and a hard length cap enforced. Config maps additionally drop keys
//! that could cause field or prototype injection downstream.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// Hard cap on any single sanitized string.
pub const MAX_TEXT_LEN: usize = 1000;

/// Keys dropped from client-supplied maps.
const INJECTION_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("input exceeds maximum length of {MAX_TEXT_LEN} characters")]
    TooLong,
}

/// Strip markup and control characters from a string and enforce the
/// length cap. Leading/trailing whitespace is trimmed.
pub fn sanitize_text(input: &str) -> Result<String, SanitizeError> {
    let stripped = TAG_RE.replace_all(input.trim(), "");
    let cleaned: String = stripped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    if cleaned.chars().count() > MAX_TEXT_LEN {
        return Err(SanitizeError::TooLong);
    }
    Ok(cleaned)
}

/// Recursively sanitize a JSON map: injection-prone keys are dropped,
/// string values pass through [`sanitize_text`], nested maps recurse.
pub fn sanitize_json(map: &Map<String, Value>) -> Result<Map<String, Value>, SanitizeError> {
    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        if INJECTION_KEYS.contains(&key.as_str()) {
            continue;
        }
        let sanitized = match value {
            Value::String(s) => Value::String(sanitize_text(s)?),
            Value::Object(inner) => Value::Object(sanitize_json(inner)?),
            other => other.clone(),
        };
        out.insert(key.clone(), sanitized);
    }
    Ok(out)
}
