//! Timestamp parsing and second-resolution comparison.
//!
//! Local sources and the remote service rarely agree on a timestamp format:
//! databases return `2024-03-01 10:00:00.123`, the API stores RFC 3339, and
//! some sources use epoch milliseconds. All of them are normalized to UTC
//! before comparing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Parses a timestamp column value.
///
/// Strings are tried as RFC 3339, then as naive date-times (assumed UTC),
/// then as plain dates. Numbers are epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_str(s.trim()),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn parse_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Returns true when the local and remote timestamps are the same at
/// one-second resolution.
///
/// The difference is truncated towards zero, so values less than a second
/// apart match. When neither side parses, the raw values are compared (two
/// missing timestamps match); when only one side parses, they differ.
pub fn timestamps_match(local: Option<&Value>, remote: Option<&Value>) -> bool {
    let parsed_local = local.and_then(parse_timestamp);
    let parsed_remote = remote.and_then(parse_timestamp);

    match (parsed_local, parsed_remote) {
        (Some(a), Some(b)) => (a - b).num_seconds() == 0,
        (None, None) => {
            let a = local.filter(|v| !v.is_null());
            let b = remote.filter(|v| !v.is_null());
            a == b
        }
        _ => false,
    }
}
