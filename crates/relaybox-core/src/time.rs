//! Timestamp helpers.

use chrono::Utc;

/// Returns the current time as an RFC3339 string in UTC, the format every
/// timestamp column is stored and compared as.
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
