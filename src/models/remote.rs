//! Field extraction helpers for raw API records
//!
//! The remote dataset is loosely typed: identifiers arrive as strings or
//! numbers, dates come in several layouts and penalties may be strings.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::RecordError;

/// Borrow a raw record as a JSON object
pub fn as_object(raw: &Value) -> Result<&Map<String, Value>, RecordError> {
    raw.as_object().ok_or(RecordError::NotAnObject)
}

/// Optional trimmed string; numbers are rendered, empty strings become `None`
pub fn opt_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Required string field
pub fn req_str(obj: &Map<String, Value>, key: &str) -> Result<String, RecordError> {
    opt_str(obj, key).ok_or_else(|| RecordError::MissingField(key.to_string()))
}

/// Optional date field; absent or empty is `None`, unparseable is an error
pub fn opt_date(obj: &Map<String, Value>, key: &str) -> Result<Option<NaiveDate>, RecordError> {
    match opt_str(obj, key) {
        None => Ok(None),
        Some(raw) => parse_date(&raw).map(Some).ok_or(RecordError::InvalidField {
            field: key.to_string(),
            value: raw,
        }),
    }
}

/// Required date field
pub fn req_date(obj: &Map<String, Value>, key: &str) -> Result<NaiveDate, RecordError> {
    opt_date(obj, key)?.ok_or_else(|| RecordError::MissingField(key.to_string()))
}

/// Required timestamp, looked up under each key in turn
pub fn req_timestamp(
    obj: &Map<String, Value>,
    keys: &[&str],
) -> Result<DateTime<Utc>, RecordError> {
    let (key, raw) = keys
        .iter()
        .find_map(|k| opt_str(obj, k).map(|v| (*k, v)))
        .ok_or_else(|| RecordError::MissingField(keys.join("|")))?;

    parse_timestamp(&raw).ok_or(RecordError::InvalidField {
        field: key.to_string(),
        value: raw,
    })
}

/// Monetary amount; missing or unparseable amounts count as zero
pub fn amount(obj: &Map<String, Value>, key: &str) -> f64 {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().replace(',', "").parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Optional integer count
pub fn opt_int(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse `YYYY-MM-DD` (optionally followed by a time part) or `MM/DD/YYYY`
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    raw.get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
        .or_else(|| NaiveDate::parse_from_str(raw, "%m/%d/%Y").ok())
}

/// Parse a publication timestamp
///
/// Accepts RFC 3339, `YYYY-MM-DD[T ]HH:MM:SS` with an optional fraction or
/// US timezone suffix (treated as UTC), and bare dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    let stripped = raw
        .split_whitespace()
        .filter(|part| !is_zone_suffix(part))
        .collect::<Vec<_>>()
        .join(" ");

    for layout in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&stripped, layout) {
            return Some(naive.and_utc());
        }
    }

    parse_date(&stripped)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn is_zone_suffix(part: &str) -> bool {
    matches!(
        part,
        "UTC" | "GMT" | "EST" | "EDT" | "CST" | "CDT" | "MST" | "MDT" | "PST" | "PDT"
    )
}

/// Canonical storage and comparison form for timestamps
///
/// Fixed width so that lexical order in SQLite matches chronological order.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
