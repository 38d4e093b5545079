//! Base64 auto-detection and multi-encoding decode, for payloads that
//! wrap an entire subscription or a single VMess/Shadowsocks link.

use base64::engine::general_purpose::{
    STANDARD as STD, STANDARD_NO_PAD as STD_NO_PAD, URL_SAFE as URL, URL_SAFE_NO_PAD as URL_NO_PAD,
};
use base64::Engine;

/// Strips whitespace, then tries standard, unpadded-standard, URL-safe and
/// unpadded-URL-safe alphabets in turn; if none decode and the cleaned
/// string's length isn't a multiple of four, repairs padding and retries
/// the padded alphabets once more.
pub fn decode_base64_string(raw: &str) -> Option<Vec<u8>> {
    let clean: String = raw
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '\t' | ' '))
        .collect();
    if clean.is_empty() {
        return None;
    }

    for engine in [&STD, &STD_NO_PAD, &URL, &URL_NO_PAD] {
        if let Ok(out) = engine.decode(&clean) {
            return Some(out);
        }
    }

    let remainder = clean.len() % 4;
    if remainder != 0 {
        let mut fixed = clean.clone();
        fixed.push_str(&"=".repeat(4 - remainder));
        for engine in [&STD, &URL] {
            if let Ok(out) = engine.decode(&fixed) {
                return Some(out);
            }
        }
    }
    None
}

/// Heuristic: at least 16 characters, every character drawn from the
/// base64 alphabet (plus CR/LF, tolerated as noise a provider inserted).
pub fn looks_like_base64(s: &str) -> bool {
    if s.len() < 16 {
        return false;
    }
    s.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_' | '\r' | '\n')
    })
}

/// Applies the whole-payload base64 auto-detect: trims, checks the
/// heuristic, decodes, and trims the decoded bytes — returns `None` if any
/// step fails or the result is empty.
pub fn decode_base64_payload(payload: &[u8]) -> Option<Vec<u8>> {
    let raw = std::str::from_utf8(payload).ok()?.trim();
    if raw.is_empty() || !looks_like_base64(raw) {
        return None;
    }
    let decoded = decode_base64_string(raw)?;
    let trimmed = trim_ascii(&decoded);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_vec())
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &bytes[s..=e],
        _ => &[],
    }
}
