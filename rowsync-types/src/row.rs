//! Local rows and primary-key normalization.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A row from a local source: column name to JSON value.
///
/// Rows are owned and mutated in place by the attachment and encryption
/// stages before they are committed.
pub type Row = serde_json::Map<String, Value>;

/// A primary-key value in the form used for comparisons.
///
/// Text and numbers never compare equal to each other, so `1` and `"1"`
/// are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComparableKey {
    /// A string key, lower-cased when matching is case-insensitive.
    Text(String),
    /// A number key in canonical textual form.
    Number(String),
    /// A boolean key.
    Bool(bool),
}

impl fmt::Display for ComparableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparableKey::Text(s) | ComparableKey::Number(s) => f.write_str(s),
            ComparableKey::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Derives the comparison key for a primary-key value.
///
/// Returns `None` for values that cannot identify a row: missing, `null`,
/// empty strings, `false`, zero, arrays and objects.
#[must_use]
pub fn normalize_key(value: Option<&Value>, case_insensitive: bool) -> Option<ComparableKey> {
    let value = value?;
    if !is_truthy(value) {
        return None;
    }

    match value {
        Value::String(s) if case_insensitive => Some(ComparableKey::Text(s.to_lowercase())),
        Value::String(s) => Some(ComparableKey::Text(s.clone())),
        Value::Number(n) => {
            let canonical = match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => i.to_string(),
                (None, Some(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    (f as i64).to_string()
                }
                _ => n.to_string(),
            };
            Some(ComparableKey::Number(canonical))
        }
        Value::Bool(b) => Some(ComparableKey::Bool(*b)),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Loose truthiness used for delete markers, encrypted fields and keys.
///
/// `null`, `false`, `0`, `NaN` and `""` are falsy; everything else,
/// including empty arrays and objects, is truthy.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
