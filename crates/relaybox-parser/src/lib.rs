//! Auto-detecting multi-format subscription parser: sing-box JSON, Clash
//! YAML, a traditional `vmess://`/`vless://`/`trojan://`/`ss://` URI list,
//! and base64-wrapped variants of all three.

mod clash;
mod encoding;
mod model;
mod singbox;
mod transport;
mod uri;
mod value;

pub use model::OutboundItem;

use relaybox_core::Error;

/// Detects the payload's format and returns its normalised outbounds, in
/// the order they appeared in the source. Detection order: sing-box JSON,
/// Clash YAML, traditional URI list, then (if none of those matched) a
/// base64 decode of the whole payload retried through all three stages.
pub fn parse_subscription(body: &[u8]) -> Result<Vec<OutboundItem>, Error> {
    let trimmed = trim_slice(body);
    if trimmed.is_empty() {
        return Err(Error::new("SUB_PARSE_FAILED", "empty subscription body"));
    }

    if let Some(result) = singbox::try_parse(trimmed) {
        return finalize(result, "singbox_json");
    }
    if let Some(items) = clash::try_parse(trimmed) {
        return finalize(Ok(items), "clash_yaml");
    }
    if let Some(items) = uri::try_parse(trimmed) {
        return finalize(Ok(items), "traditional_uri");
    }

    if let Some(decoded) = encoding::decode_base64_payload(trimmed) {
        if let Some(result) = singbox::try_parse(&decoded) {
            return finalize(result, "singbox_base64");
        }
        if let Some(items) = clash::try_parse(&decoded) {
            return finalize(Ok(items), "clash_base64");
        }
        if let Some(items) = uri::try_parse(&decoded) {
            return finalize(Ok(items), "traditional_base64");
        }
    }

    Err(Error::new(
        "SUB_FORMAT_UNSUPPORTED",
        "subscription format unsupported",
    ))
}

fn finalize(
    result: Result<Vec<OutboundItem>, Error>,
    format: &'static str,
) -> Result<Vec<OutboundItem>, Error> {
    let out = result?;
    if out.is_empty() {
        return Err(Error::new("SUB_EMPTY_OUTBOUNDS", "no supported outbounds found")
            .with_detail("format", format));
    }
    Ok(out)
}

fn trim_slice(body: &[u8]) -> &[u8] {
    let start = body.iter().position(|b| !b.is_ascii_whitespace());
    let end = body.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &body[s..=e],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_fails_parse() {
        let err = parse_subscription(b"   ").unwrap_err();
        assert_eq!(err.code, "SUB_PARSE_FAILED");
    }

    #[test]
    fn unrecognised_payload_is_format_unsupported() {
        let err = parse_subscription(b"not a subscription at all, just prose").unwrap_err();
        assert_eq!(err.code, "SUB_FORMAT_UNSUPPORTED");
    }

    #[test]
    fn singbox_array_recognises_outbounds_and_filters_routing_types() {
        let body = br#"[
            {"type":"direct","tag":"direct"},
            {"type":"vmess","tag":"vm1","server":"1.2.3.4","server_port":443,"uuid":"u"}
        ]"#;
        let items = parse_subscription(body).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tag, "vm1");
        assert_eq!(items[0].kind, "vmess");
    }

    #[test]
    fn singbox_object_wrapper_with_empty_outbounds_is_empty_outbounds_error() {
        let body = br#"{"outbounds":[{"type":"direct","tag":"direct"}]}"#;
        let err = parse_subscription(body).unwrap_err();
        assert_eq!(err.code, "SUB_EMPTY_OUTBOUNDS");
        assert_eq!(
            err.details.as_ref().and_then(|d| d.get("format")),
            Some(&serde_json::json!("singbox_json"))
        );
    }

    #[test]
    fn clash_yaml_vmess_proxy_is_parsed() {
        let body = b"proxies:\n  - name: node-a\n    type: vmess\n    server: 1.2.3.4\n    port: 443\n    uuid: abc-123\n    cipher: auto\n";
        let items = parse_subscription(body).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, "vmess");
        assert_eq!(items[0].tag, "node-a");
    }

    #[test]
    fn traditional_uri_list_parses_trojan_and_skips_comments() {
        let body = b"# comment\ntrojan://secret@example.com:443?security=tls#My%20Node\n";
        let items = parse_subscription(body).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, "trojan");
        assert_eq!(items[0].tag, "My Node");
    }

    #[test]
    fn base64_wrapped_uri_list_is_decoded_and_parsed() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let inner = "trojan://secret@example.com:443?security=tls#tag\n";
        let encoded = STANDARD.encode(inner);
        let items = parse_subscription(encoded.as_bytes()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, "trojan");
    }

    #[test]
    fn shadowsocks_sip002_uri_decodes_base64_userinfo() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let userinfo = STANDARD.encode("aes-256-gcm:password");
        let link = format!("ss://{userinfo}@example.com:8388#ss-node");
        let items = parse_subscription(link.as_bytes()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tag, "ss-node");
        assert_eq!(items[0].raw["method"], "aes-256-gcm");
    }
}
