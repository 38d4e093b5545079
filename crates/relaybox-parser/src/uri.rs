//! Parses the "traditional" subscription format: a newline-separated list
//! of `vmess://`/`vless://`/`trojan://`/`ss://` links.

use crate::encoding::decode_base64_string;
use crate::model::OutboundItem;
use crate::transport::{attach_tls_from_query, attach_transport_from_query};
use crate::value::{or_default, to_string};
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use std::collections::HashMap;
use url::Url;

/// `Some(items)` once at least one line was recognised as a supported URI
/// scheme (even if it turned out to be malformed and was dropped); `None`
/// if no line matched any scheme, so the caller tries the next stage.
pub fn try_parse(payload: &[u8]) -> Option<Vec<OutboundItem>> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() {
        return Some(Vec::new());
    }

    let lines = split_subscription_lines(text);
    if lines.is_empty() {
        return None;
    }

    let mut out = Vec::with_capacity(lines.len());
    let mut recognized = 0usize;
    for line in &lines {
        let Some(item) = parse_traditional_uri(line) else {
            continue;
        };
        recognized += 1;
        if let Some(item) = item {
            out.push(item);
        }
    }
    if recognized == 0 {
        return None;
    }
    Some(out)
}

fn split_subscription_lines(text: &str) -> Vec<String> {
    let replaced = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<String> = replaced
        .split('\n')
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect();
    if !lines.is_empty() {
        return lines;
    }
    // Some providers concatenate links with spaces.
    text.split_whitespace()
        .filter(|p| p.contains("://"))
        .map(str::to_string)
        .collect()
}

/// `None` if the line doesn't start with a recognised scheme at all.
/// `Some(None)` if the scheme matched but the link was malformed (the
/// line is still "recognized" for the empty-subscription check, it just
/// contributes no outbound). `Some(Some(item))` on success.
fn parse_traditional_uri(line: &str) -> Option<Option<OutboundItem>> {
    let lower = line.to_lowercase();
    if lower.starts_with("vmess://") {
        Some(parse_vmess_uri(line))
    } else if lower.starts_with("vless://") {
        Some(parse_vless_uri(line))
    } else if lower.starts_with("trojan://") {
        Some(parse_trojan_uri(line))
    } else if lower.starts_with("ss://") {
        Some(parse_shadowsocks_uri(line))
    } else {
        None
    }
}

fn parse_vmess_uri(link: &str) -> Option<OutboundItem> {
    let enc = link.trim_start_matches("vmess://").trim();
    let decoded = decode_base64_string(enc)?;
    let m: Value = serde_json::from_slice(&decoded).ok()?;

    let server = to_string(m.get("add"));
    let port: i64 = to_string(m.get("port")).parse().unwrap_or(0);
    let uuid = to_string(m.get("id"));
    if server.is_empty() || port <= 0 || uuid.is_empty() {
        return None;
    }

    let mut out = serde_json::Map::new();
    out.insert("type".into(), json!("vmess"));
    out.insert("tag".into(), json!(to_string(m.get("ps"))));
    out.insert("server".into(), json!(server));
    out.insert("server_port".into(), json!(port));
    out.insert("uuid".into(), json!(uuid));
    out.insert(
        "security".into(),
        json!(or_default(&to_string(m.get("scy")), "auto")),
    );
    if let Ok(alter_id) = to_string(m.get("aid")).parse::<i64>() {
        out.insert("alter_id".into(), json!(alter_id));
    }

    if to_string(m.get("net")).to_lowercase() == "ws" {
        let mut headers = serde_json::Map::new();
        let host = to_string(m.get("host"));
        if !host.is_empty() {
            headers.insert("Host".into(), json!(host));
        }
        let mut transport = serde_json::Map::new();
        transport.insert("type".into(), json!("ws"));
        transport.insert(
            "path".into(),
            json!(or_default(&to_string(m.get("path")), "/")),
        );
        if !headers.is_empty() {
            transport.insert("headers".into(), Value::Object(headers));
        }
        out.insert("transport".into(), Value::Object(transport));
    }

    if to_string(m.get("tls")).eq_ignore_ascii_case("tls") {
        let mut tls = serde_json::Map::new();
        tls.insert("enabled".into(), json!(true));
        let sni = to_string(m.get("sni"));
        if !sni.is_empty() {
            tls.insert("server_name".into(), json!(sni));
        }
        out.insert("tls".into(), Value::Object(tls));
    }

    let tag = to_string(m.get("ps"));
    Some(OutboundItem {
        tag,
        kind: "vmess".to_string(),
        raw: Value::Object(out),
    })
}

fn parse_vless_uri(link: &str) -> Option<OutboundItem> {
    let url = Url::parse(link).ok()?;
    let uuid = percent_decode(url.username());
    let server = url.host_str()?.to_string();
    let port = url.port()?;
    if uuid.is_empty() || server.is_empty() || port == 0 {
        return None;
    }
    let tag = fragment_tag(url.fragment());
    let query = query_map(&url);

    let mut out = serde_json::Map::new();
    out.insert("type".into(), json!("vless"));
    out.insert("tag".into(), json!(tag));
    out.insert("server".into(), json!(server));
    out.insert("server_port".into(), json!(port));
    out.insert("uuid".into(), json!(uuid));
    if let Some(flow) = query.get("flow").filter(|f| !f.is_empty()) {
        out.insert("flow".into(), json!(flow));
    }
    attach_transport_from_query(&mut out, &query);
    attach_tls_from_query(&mut out, &query);

    Some(OutboundItem {
        tag,
        kind: "vless".to_string(),
        raw: Value::Object(out),
    })
}

fn parse_trojan_uri(link: &str) -> Option<OutboundItem> {
    let url = Url::parse(link).ok()?;
    let password = percent_decode(url.username());
    let server = url.host_str()?.to_string();
    let port = url.port()?;
    if password.is_empty() || server.is_empty() || port == 0 {
        return None;
    }
    let tag = fragment_tag(url.fragment());
    let query = query_map(&url);

    let mut out = serde_json::Map::new();
    out.insert("type".into(), json!("trojan"));
    out.insert("tag".into(), json!(tag));
    out.insert("server".into(), json!(server));
    out.insert("server_port".into(), json!(port));
    out.insert("password".into(), json!(password));
    attach_transport_from_query(&mut out, &query);
    attach_tls_from_query(&mut out, &query);

    Some(OutboundItem {
        tag,
        kind: "trojan".to_string(),
        raw: Value::Object(out),
    })
}

fn parse_shadowsocks_uri(link: &str) -> Option<OutboundItem> {
    if let Ok(url) = Url::parse(link) {
        if url.host_str().is_some() {
            let (method, password) = decode_ss_user(&url)?;
            let server = url.host_str()?.to_string();
            let port = url.port()?;
            if port == 0 {
                return None;
            }
            let tag = fragment_tag(url.fragment());
            let mut out = serde_json::Map::new();
            out.insert("type".into(), json!("shadowsocks"));
            out.insert("tag".into(), json!(tag));
            out.insert("server".into(), json!(server));
            out.insert("server_port".into(), json!(port));
            out.insert("method".into(), json!(method));
            out.insert("password".into(), json!(password));
            return Some(OutboundItem {
                tag,
                kind: "shadowsocks".to_string(),
                raw: Value::Object(out),
            });
        }
    }

    // Legacy form: ss://BASE64(method:password@host:port)#tag
    let mut raw = link.trim_start_matches("ss://").trim().to_string();
    let mut tag = String::new();
    if let Some(idx) = raw.find('#') {
        tag = fragment_tag(Some(&raw[idx + 1..]));
        raw.truncate(idx);
    }
    let decoded = decode_base64_string(&raw)?;
    let plain = String::from_utf8(decoded).ok()?;
    let at = plain.rfind('@')?;
    if at == 0 || at >= plain.len() - 1 {
        return None;
    }
    let cred = &plain[..at];
    let host_port = &plain[at + 1..];
    let (host, port_raw) = host_port.rsplit_once(':')?;
    let (method, password) = cred.split_once(':')?;
    if method.is_empty() {
        return None;
    }
    let port: i64 = port_raw.parse().ok()?;
    if port <= 0 {
        return None;
    }

    let mut out = serde_json::Map::new();
    out.insert("type".into(), json!("shadowsocks"));
    out.insert("tag".into(), json!(tag));
    out.insert("server".into(), json!(host));
    out.insert("server_port".into(), json!(port));
    out.insert("method".into(), json!(method));
    out.insert("password".into(), json!(password));
    Some(OutboundItem {
        tag,
        kind: "shadowsocks".to_string(),
        raw: Value::Object(out),
    })
}

fn decode_ss_user(url: &Url) -> Option<(String, String)> {
    let username = percent_decode(url.username());
    if let Some(password) = url.password() {
        if username.is_empty() {
            return None;
        }
        return Some((username, percent_decode(password)));
    }
    if username.is_empty() {
        return None;
    }
    // SIP002: userinfo is base64("method:password").
    if let Some(decoded) = decode_base64_string(&username) {
        if let Ok(text) = String::from_utf8(decoded) {
            if let Some((m, p)) = text.split_once(':') {
                if !m.is_empty() {
                    return Some((m.to_string(), p.to_string()));
                }
            }
        }
    }
    username
        .split_once(':')
        .filter(|(m, _)| !m.is_empty())
        .map(|(m, p)| (m.to_string(), p.to_string()))
}

fn fragment_tag(fragment: Option<&str>) -> String {
    match fragment {
        None | Some("") => String::new(),
        Some(f) => percent_decode(f),
    }
}

fn percent_decode(s: &str) -> String {
    percent_decode_str(s)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
