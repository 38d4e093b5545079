//! The normalised output of every parse stage.

use serde_json::Value;

/// A single outbound recognised from a subscription payload, prior to
/// synthesis: a tag, its lowercase protocol type, and the raw sing-box
/// style outbound object.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundItem {
    /// Human/machine label; may be empty if the source omitted one.
    pub tag: String,
    /// Lowercase protocol type (`vmess`, `vless`, `trojan`, `shadowsocks`, ...).
    pub kind: String,
    /// The outbound object as it will be embedded verbatim into the
    /// synthesised runtime config.
    pub raw: Value,
}

/// Protocol/structural types that never represent a selectable outbound
/// (routing primitives and group constructs sing-box already generates
/// itself), filtered out of any parsed `outbounds` array.
pub fn is_filtered_type(kind: &str) -> bool {
    matches!(kind, "direct" | "block" | "dns" | "selector" | "urltest")
}
