//! Content hashing for synthesised configs.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of arbitrary bytes.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 digest of a value's canonical JSON encoding, empty string if
/// the value can't be serialised.
#[must_use]
pub fn json_hash<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_vec(value) {
        Ok(bytes) => sha256_hex(&bytes),
        Err(_) => String::new(),
    }
}
