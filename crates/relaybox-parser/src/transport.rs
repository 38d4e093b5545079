//! Transport (`ws`/`grpc`) and TLS block assembly shared by the Clash and
//! URI parse stages.

use crate::value::{map_from, to_bool, to_string};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Reads Clash's `network`/`ws-opts`/`grpc-opts` fields and, if
/// recognised, inserts a sing-box `transport` block into `out`.
pub fn attach_transport_clash(out: &mut serde_json::Map<String, Value>, proxy: &Value) {
    let net_type = to_string(proxy.get("network")).to_lowercase();
    match net_type.as_str() {
        "ws" => {
            let mut ws_opts = map_from(proxy.get("ws-opts"));
            if ws_opts.is_empty() {
                ws_opts = map_from(proxy.get("ws_opts"));
            }
            let mut transport = serde_json::Map::new();
            transport.insert("type".into(), json!("ws"));
            let path = to_string(ws_opts.get("path"));
            transport.insert(
                "path".into(),
                json!(if path.is_empty() { "/".to_string() } else { path }),
            );
            let headers = map_from(ws_opts.get("headers"));
            if !headers.is_empty() {
                transport.insert("headers".into(), Value::Object(headers));
            }
            out.insert("transport".into(), Value::Object(transport));
        }
        "grpc" => {
            let mut grpc_opts = map_from(proxy.get("grpc-opts"));
            if grpc_opts.is_empty() {
                grpc_opts = map_from(proxy.get("grpc_opts"));
            }
            let mut service_name = to_string(grpc_opts.get("grpc-service-name"));
            if service_name.is_empty() {
                service_name = to_string(grpc_opts.get("service_name"));
            }
            let mut transport = serde_json::Map::new();
            transport.insert("type".into(), json!("grpc"));
            if !service_name.is_empty() {
                transport.insert("service_name".into(), json!(service_name));
            }
            out.insert("transport".into(), Value::Object(transport));
        }
        _ => {}
    }
}

/// Reads Clash's `tls`/`servername`/`sni`/`skip-cert-verify` fields and,
/// if any indicate TLS involvement, inserts a sing-box `tls` block.
pub fn attach_tls_clash(out: &mut serde_json::Map<String, Value>, proxy: &Value) {
    let tls_enabled = to_bool(proxy.get("tls"));
    let mut server_name = to_string(proxy.get("servername"));
    if server_name.is_empty() {
        server_name = to_string(proxy.get("sni"));
    }
    let insecure = to_bool(proxy.get("skip-cert-verify"));
    if !tls_enabled && server_name.is_empty() && !insecure {
        return;
    }
    let mut tls = serde_json::Map::new();
    tls.insert("enabled".into(), json!(tls_enabled));
    if !server_name.is_empty() {
        tls.insert("server_name".into(), json!(server_name));
    }
    if insecure {
        tls.insert("insecure".into(), json!(true));
    }
    out.insert("tls".into(), Value::Object(tls));
}

/// URI-query equivalent of [`attach_transport_clash`], for VLESS/Trojan
/// links where transport hints arrive as `?type=ws&host=...`.
pub fn attach_transport_from_query(
    out: &mut serde_json::Map<String, Value>,
    query: &HashMap<String, String>,
) {
    match query.get("type").map(|s| s.to_lowercase()).as_deref() {
        Some("ws") => {
            let mut transport = serde_json::Map::new();
            transport.insert("type".into(), json!("ws"));
            let path = query.get("path").cloned().unwrap_or_default();
            transport.insert(
                "path".into(),
                json!(if path.is_empty() { "/".to_string() } else { path }),
            );
            if let Some(host) = query.get("host").filter(|h| !h.is_empty()) {
                let mut headers = serde_json::Map::new();
                headers.insert("Host".into(), json!(host));
                transport.insert("headers".into(), Value::Object(headers));
            }
            out.insert("transport".into(), Value::Object(transport));
        }
        Some("grpc") => {
            let mut transport = serde_json::Map::new();
            transport.insert("type".into(), json!("grpc"));
            if let Some(service_name) = query.get("serviceName").filter(|s| !s.is_empty()) {
                transport.insert("service_name".into(), json!(service_name));
            }
            out.insert("transport".into(), Value::Object(transport));
        }
        _ => {}
    }
}

/// URI-query equivalent of [`attach_tls_clash`]: `security=tls|xtls|reality`
/// plus `allowInsecure`/`insecure` in `{1,true}` (case-insensitive).
pub fn attach_tls_from_query(
    out: &mut serde_json::Map<String, Value>,
    query: &HashMap<String, String>,
) {
    let security = query
        .get("security")
        .map(|s| s.to_lowercase())
        .unwrap_or_default();
    let tls_enabled = matches!(security.as_str(), "tls" | "xtls" | "reality");
    let truthy = |key: &str| {
        query
            .get(key)
            .map(|v| v.eq_ignore_ascii_case("1") || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    };
    let insecure = truthy("allowInsecure") || truthy("insecure");
    let mut server_name = query.get("sni").cloned().unwrap_or_default();
    if server_name.is_empty() {
        server_name = query.get("peer").cloned().unwrap_or_default();
    }
    if !tls_enabled && server_name.is_empty() && !insecure {
        return;
    }
    let mut tls = serde_json::Map::new();
    tls.insert("enabled".into(), json!(tls_enabled));
    if !server_name.is_empty() {
        tls.insert("server_name".into(), json!(server_name));
    }
    if insecure {
        tls.insert("insecure".into(), json!(true));
    }
    out.insert("tls".into(), Value::Object(tls));
}
