use chrono::Utc;
use serde_json::Value;

/// RFC3339 timestamp in UTC (progress file stamp).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

/// Filesystem-safe rendition of a dialog display name, shared by the sink
/// file layout and the per-dialog media directories.
pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Uppercased, special-character-stripped form used for allow-list
/// substring matching.
pub fn normalize_for_match(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// Stringify a scalar JSON value (ids come over the wire as either).
pub fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
