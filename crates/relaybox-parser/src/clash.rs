//! Parses a Clash-style YAML subscription (a document with a `proxies` list).

use crate::model::OutboundItem;
use crate::transport::{attach_tls_clash, attach_transport_clash};
use crate::value::{or_default, to_int, to_optional_int, to_string};
use serde_json::{json, Value};

#[derive(serde::Deserialize)]
struct ClashDoc {
    #[serde(default)]
    proxies: Vec<Value>,
}

/// `Some(items)` if the payload parses as YAML with a `proxies` key
/// (even if empty or containing no recognised proxy types); `None` if the
/// payload isn't YAML at all, so the caller tries the next stage.
pub fn try_parse(payload: &[u8]) -> Option<Vec<OutboundItem>> {
    let doc: ClashDoc = serde_yaml::from_slice(payload).ok()?;
    let mut out = Vec::with_capacity(doc.proxies.len());
    for proxy in &doc.proxies {
        if let Some(item) = proxy_to_outbound(proxy) {
            out.push(item);
        }
    }
    Some(out)
}

fn proxy_to_outbound(proxy: &Value) -> Option<OutboundItem> {
    let kind = to_string(proxy.get("type")).to_lowercase();
    let tag = to_string(proxy.get("name"));
    let server = to_string(proxy.get("server"));
    let port = to_int(proxy.get("port"));
    if kind.is_empty() || server.is_empty() || port <= 0 {
        return None;
    }

    let mut out = serde_json::Map::new();
    match kind.as_str() {
        "ss" | "shadowsocks" => {
            let mut method = to_string(proxy.get("cipher"));
            if method.is_empty() {
                method = to_string(proxy.get("method"));
            }
            let password = to_string(proxy.get("password"));
            if method.is_empty() || password.is_empty() {
                return None;
            }
            out.insert("type".into(), json!("shadowsocks"));
            out.insert("tag".into(), json!(tag));
            out.insert("server".into(), json!(server));
            out.insert("server_port".into(), json!(port));
            out.insert("method".into(), json!(method));
            out.insert("password".into(), json!(password));
        }
        "vmess" => {
            let uuid = to_string(proxy.get("uuid"));
            if uuid.is_empty() {
                return None;
            }
            out.insert("type".into(), json!("vmess"));
            out.insert("tag".into(), json!(tag));
            out.insert("server".into(), json!(server));
            out.insert("server_port".into(), json!(port));
            out.insert("uuid".into(), json!(uuid));
            out.insert(
                "security".into(),
                json!(or_default(&to_string(proxy.get("cipher")), "auto")),
            );
            if let Some(alter_id) = to_optional_int(proxy.get("alterId")) {
                out.insert("alter_id".into(), json!(alter_id));
            }
            attach_transport_clash(&mut out, proxy);
            attach_tls_clash(&mut out, proxy);
        }
        "vless" => {
            let uuid = to_string(proxy.get("uuid"));
            if uuid.is_empty() {
                return None;
            }
            out.insert("type".into(), json!("vless"));
            out.insert("tag".into(), json!(tag));
            out.insert("server".into(), json!(server));
            out.insert("server_port".into(), json!(port));
            out.insert("uuid".into(), json!(uuid));
            let flow = to_string(proxy.get("flow"));
            if !flow.is_empty() {
                out.insert("flow".into(), json!(flow));
            }
            attach_transport_clash(&mut out, proxy);
            attach_tls_clash(&mut out, proxy);
        }
        "trojan" => {
            let password = to_string(proxy.get("password"));
            if password.is_empty() {
                return None;
            }
            out.insert("type".into(), json!("trojan"));
            out.insert("tag".into(), json!(tag));
            out.insert("server".into(), json!(server));
            out.insert("server_port".into(), json!(port));
            out.insert("password".into(), json!(password));
            attach_transport_clash(&mut out, proxy);
            attach_tls_clash(&mut out, proxy);
        }
        _ => return None,
    }

    Some(OutboundItem {
        tag,
        kind,
        raw: Value::Object(out),
    })
}
