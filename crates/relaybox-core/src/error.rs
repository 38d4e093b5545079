//! Stable error taxonomy shared by every relaybox component.

use axum::http::StatusCode;
use std::collections::HashMap;

/// Result type alias for relaybox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A structured error carrying a stable string code, a human message and
/// optional machine-readable details.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Error {
    /// Stable code such as `SUB_FETCH_FAILED`, suitable for API responses.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details (truncated outputs, offending values, ...).
    pub details: Option<serde_json::Value>,
}

impl Error {
    /// Build an error with no details.
    pub fn new<S: Into<String>>(code: &'static str, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach a details map, replacing any previous one.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach a single key/value detail, merging into an existing object.
    #[must_use]
    pub fn with_detail<S: Into<String>>(mut self, key: &str, value: S) -> Self {
        let mut map = match self.details.take() {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        map.insert(key.to_string(), serde_json::Value::String(value.into()));
        self.details = Some(serde_json::Value::Object(map));
        self
    }

    /// Maps the stable code to the HTTP status the external surface should
    /// respond with: client-input codes to 400, not-found codes to 404,
    /// conflicts to 409, oversize inputs to 413, rate limits to 429,
    /// upstream fetch failures to 502, service-unavailable substrates to
    /// 503, unimplemented to 501, everything else to 500.
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self.code {
            "REQ_BAD_REQUEST" | "REQ_VALIDATION_FAILED" | "REQ_MISSING_FIELD"
            | "REQ_INVALID_FIELD" | "CFG_JSON_INVALID" | "SUB_PARSE_FAILED"
            | "SUB_FORMAT_UNSUPPORTED" | "SUB_EMPTY_OUTBOUNDS" | "SUB_INVALID_URL"
            | "NODE_INVALID_OUTBOUND" => StatusCode::BAD_REQUEST,
            "REQ_UNSUPPORTED_OPERATION" => StatusCode::BAD_REQUEST,
            "DB_NOT_FOUND" | "SUB_NOT_FOUND" | "NODE_NOT_FOUND" => StatusCode::NOT_FOUND,
            "CFG_NO_ENABLED_NODES" | "JOB_RELOAD_IN_PROGRESS" | "JOB_REFRESH_IN_PROGRESS"
            | "NODE_TAG_CONFLICT" | "DB_CONSTRAINT_VIOLATION" | "SUB_DISABLED" => {
                StatusCode::CONFLICT
            }
            "REQ_TOO_LARGE" | "SUB_RESPONSE_TOO_LARGE" => StatusCode::PAYLOAD_TOO_LARGE,
            "JOB_RATE_LIMITED" => StatusCode::TOO_MANY_REQUESTS,
            "SUB_FETCH_FAILED" | "SUB_FETCH_TIMEOUT" | "SUB_HTTP_STATUS_ERROR" => {
                StatusCode::BAD_GATEWAY
            }
            "RT_RESTART_FAILED" | "RT_START_FAILED" | "RT_STOP_FAILED" | "RT_STATUS_FAILED"
            | "CFG_CHECK_FAILED" => StatusCode::SERVICE_UNAVAILABLE,
            "NOT_IMPLEMENTED" => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convenience constructor for the `REQ_MISSING_FIELD` code.
    pub fn missing_field(field: &str) -> Self {
        Self::new("REQ_MISSING_FIELD", format!("missing field: {field}"))
            .with_detail("field", field)
    }

    /// Convenience constructor for the `REQ_INVALID_FIELD` code.
    pub fn invalid_field<S: Into<String>>(field: &str, value: S) -> Self {
        Self::new("REQ_INVALID_FIELD", format!("invalid field: {field}"))
            .with_detail("field", field)
            .with_detail("value", value)
    }

    /// Convenience constructor for `DB_NOT_FOUND`-shaped lookups.
    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    /// Truncates an output blob to `limit` bytes, matching the apply
    /// pipeline's rule of never surfacing unbounded command output.
    #[must_use]
    pub fn truncate_output(output: &[u8], limit: usize) -> String {
        let text = String::from_utf8_lossy(output);
        if text.len() <= limit {
            text.into_owned()
        } else {
            let mut truncated = text.chars().take(limit).collect::<String>();
            truncated.push_str("...(truncated)");
            truncated
        }
    }
}

impl Error {
    /// Wraps an arbitrary persistence-layer failure as `DB_ERROR`. Callers
    /// in `relaybox-store` use this instead of a `From<sqlx::Error>` impl
    /// (which the orphan rules wouldn't allow across the crate boundary)
    /// so that more specific codes (`DB_NOT_FOUND`, `DB_TX_FAILED`, ...)
    /// can still be chosen explicitly where the call site knows better.
    pub fn db(err: impl std::fmt::Display) -> Self {
        Self::new("DB_ERROR", err.to_string())
    }
}

/// Builds a `serde_json::Value` details object from string key/value pairs,
/// used by the apply pipeline to attach `rollback_attempted`-style flags.
#[must_use]
pub fn details_map(pairs: &[(&str, String)]) -> serde_json::Value {
    let mut map: HashMap<&str, String> = HashMap::new();
    for (k, v) in pairs {
        map.insert(k, v.clone());
    }
    serde_json::to_value(map).unwrap_or(serde_json::Value::Null)
}
