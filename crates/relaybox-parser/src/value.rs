//! Loose type coercion helpers for untyped proxy payloads, mirroring how
//! Clash/VMess fields are sometimes strings and sometimes numbers.

use serde_json::Value;

/// Coerces a JSON value to a trimmed string; numbers stringify, everything
/// else (including missing fields) yields an empty string.
pub fn to_string(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Coerces a JSON value to `i64`, trying numbers and numeric strings.
pub fn to_optional_int(v: Option<&Value>) -> Option<i64> {
    match v {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Like [`to_optional_int`] but defaults to zero.
pub fn to_int(v: Option<&Value>) -> i64 {
    to_optional_int(v).unwrap_or(0)
}

/// Coerces a JSON value to a boolean: native bools pass through; strings
/// `1`/`true`/`yes`/`on` (case-insensitive) are truthy; numbers are
/// truthy when non-zero; everything else is false.
pub fn to_bool(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => {
            let lower = s.trim().to_lowercase();
            matches!(lower.as_str(), "1" | "true" | "yes" | "on")
        }
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

/// Returns `value` unless it's blank, in which case returns `fallback`.
pub fn or_default(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

/// Borrows a nested object field as a map, or an empty map if absent or
/// not an object.
pub fn map_from(v: Option<&Value>) -> serde_json::Map<String, Value> {
    match v {
        Some(Value::Object(m)) => m.clone(),
        _ => serde_json::Map::new(),
    }
}
