//! Result payload normalization.
//!
//! Providers answer with a bare URL, an array of URLs, an object with one of
//! several field names, or any of those serialized again as a JSON string.
//! Callers only ever need the primary asset URL.

use serde_json::Value;

/// Field names checked, in order, when the payload is an object.
const RESULT_FIELDS: &[&str] = &[
    "url",
    "urls",
    "resultUrls",
    "result_urls",
    "images",
    "image",
    "video",
    "videos",
    "output",
    "result",
    "data",
];

/// First asset URL found in `value`, if any.
pub fn normalize_result_payload(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if looks_like_json(trimmed) {
                if let Ok(inner) = serde_json::from_str::<Value>(trimmed) {
                    return normalize_result_payload(&inner);
                }
            }
            is_url(trimmed).then(|| trimmed.to_string())
        }
        Value::Array(items) => items.iter().find_map(normalize_result_payload),
        Value::Object(map) => RESULT_FIELDS
            .iter()
            .filter_map(|field| map.get(*field))
            .find_map(normalize_result_payload),
        _ => None,
    }
}

fn looks_like_json(s: &str) -> bool {
    s.starts_with('{') || s.starts_with('[') || s.starts_with('"')
}

fn is_url(s: &str) -> bool {
    s.starts_with("https://") || s.starts_with("http://")
}
