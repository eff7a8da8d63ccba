//! Payload sanitizing for outbound events.
//!
//! Keys that look like credentials have their value replaced with
//! [`REDACTED`], and long strings are cut at a character boundary with
//! [`TRUNCATION_MARKER`] appended. Objects and arrays are walked recursively.

use serde_json::{Map, Value};

/// Replacement value for credential-like keys.
pub const REDACTED: &str = "[REDACTED]";

/// Suffix appended to truncated strings.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Default maximum length for string values before truncation.
pub const DEFAULT_MAX_STRING_LENGTH: usize = 10_000;

/// Key segments that mark a value as sensitive on their own.
const SENSITIVE_WORDS: &[&str] = &[
    "apikey",
    "password",
    "passwd",
    "token",
    "secret",
    "secrets",
    "authorization",
    "credential",
    "credentials",
];

/// Adjacent key segments that mark a value as sensitive together.
const SENSITIVE_PAIRS: &[(&str, &str)] = &[("api", "key"), ("private", "key")];

/// Sanitizer settings.
#[derive(Clone, Debug)]
pub struct Sanitizer {
    max_string_length: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STRING_LENGTH)
    }
}

impl Sanitizer {
    /// Create a sanitizer truncating strings longer than `max_string_length` bytes.
    pub fn new(max_string_length: usize) -> Self {
        Self { max_string_length }
    }

    /// Return a sanitized copy of `value`.
    pub fn sanitize(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.sanitize_map(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize(v)).collect()),
            Value::String(s) => Value::String(self.truncate(s)),
            other => other.clone(),
        }
    }

    fn sanitize_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                let value = if is_sensitive_key(key) {
                    Value::String(REDACTED.to_owned())
                } else {
                    self.sanitize(value)
                };
                (key.clone(), value)
            })
            .collect()
    }

    fn truncate(&self, s: &str) -> String {
        if s.len() <= self.max_string_length {
            return s.to_owned();
        }
        let mut end = self.max_string_length;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}{TRUNCATION_MARKER}", &s[..end])
    }
}

/// Whether a JSON key names a credential-like value.
///
/// Keys are compared by segment, so `accessToken` and `api_key` match while
/// `max_tokens` and `tokens_used` do not.
pub fn is_sensitive_key(key: &str) -> bool {
    let segments = key_segments(key);
    segments.iter().any(|s| SENSITIVE_WORDS.contains(&s.as_str()))
        || segments.windows(2).any(|pair| {
            SENSITIVE_PAIRS
                .iter()
                .any(|(a, b)| pair[0] == *a && pair[1] == *b)
        })
}

/// Lowercase words of a key split on punctuation and camelCase boundaries.
fn key_segments(key: &str) -> Vec<String> {
    let chars: Vec<char> = key.chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_uppercase() && !current.is_empty() {
            let prev = i.checked_sub(1).and_then(|j| chars.get(j));
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let boundary = prev.is_some_and(|p| {
                p.is_lowercase() || p.is_ascii_digit() || (p.is_uppercase() && next_lower)
            });
            if boundary {
                segments.push(std::mem::take(&mut current));
            }
        }
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}
