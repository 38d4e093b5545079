//! Pure configuration synthesis: combines inbounds, stored node outbounds
//! and routing settings into a runtime sing-box style JSON document. No
//! I/O; identical inputs always produce byte-identical output.

use relaybox_core::Error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A single local inbound (HTTP or SOCKS proxy listener).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyInbound {
    /// Address to bind, e.g. `0.0.0.0`.
    pub listen_address: String,
    /// Port to bind.
    pub port: u16,
    /// Whether this inbound is emitted at all.
    pub enabled: bool,
    /// `"none"` or `"basic"`.
    pub auth_mode: String,
    /// Basic-auth username, used only when `auth_mode == "basic"`.
    pub username: String,
    /// Basic-auth password, used only when `auth_mode == "basic"`.
    pub password: String,
}

/// Bypass-routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSettings {
    /// Whether private/loopback/link-local traffic bypasses the proxy.
    pub bypass_private_enabled: bool,
    /// Domain suffixes routed direct when bypass is enabled.
    pub bypass_domains: Vec<String>,
    /// CIDR blocks routed direct when bypass is enabled.
    pub bypass_cidrs: Vec<String>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            bypass_private_enabled: true,
            bypass_domains: vec!["localhost".to_string(), "local".to_string()],
            bypass_cidrs: vec![
                "127.0.0.0/8".to_string(),
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
                "169.254.0.0/16".to_string(),
                "::1/128".to_string(),
                "fc00::/7".to_string(),
                "fe80::/10".to_string(),
            ],
        }
    }
}

/// The Clash-API compatible controller sing-box exposes under
/// `experimental.clash_api`, attached only when an address is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalController {
    /// Address the clash-api listener binds to, e.g. `127.0.0.1:9090`.
    pub external_controller: String,
    /// Optional bearer secret required by clients of that API.
    pub secret: Option<String>,
}

/// Builds the runtime config. `node_outbound_jsons` are the raw
/// `outbound_json` blobs of the already policy-filtered, enabled nodes, in
/// the order they should appear; malformed entries are skipped rather than
/// failing the whole build, matching the original generator's tolerance
/// for a single bad row.
pub fn synth(
    http_in: &ProxyInbound,
    socks_in: &ProxyInbound,
    routing: &RoutingSettings,
    node_outbound_jsons: &[String],
    controller: Option<&ExternalController>,
) -> Result<Vec<u8>, Error> {
    let mut inbounds = Vec::new();
    if http_in.enabled {
        inbounds.push(build_inbound("http", "http-in", http_in));
    }
    if socks_in.enabled {
        inbounds.push(build_inbound("socks", "socks-in", socks_in));
    }

    let mut outbounds = vec![
        json!({"type": "direct", "tag": "direct"}),
        json!({"type": "block", "tag": "block"}),
    ];
    let mut tags = Vec::new();
    for raw in node_outbound_jsons {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            continue;
        };
        if let Some(tag) = value.get("tag").and_then(Value::as_str) {
            tags.push(tag.to_string());
        }
        outbounds.push(value);
    }

    match tags.len() {
        0 => outbounds.push(json!({
            "type": "selector",
            "tag": "proxy",
            "outbounds": ["direct"],
            "default": "direct",
        })),
        1 => outbounds.push(json!({
            "type": "selector",
            "tag": "proxy",
            "outbounds": tags,
            "default": tags[0],
        })),
        _ => {
            outbounds.push(json!({
                "type": "urltest",
                "tag": "proxy-auto",
                "outbounds": tags,
                "url": "https://www.gstatic.com/generate_204",
                "interval": "3m",
                "tolerance": 120,
            }));
            let mut choices = Vec::with_capacity(tags.len() + 1);
            choices.push("proxy-auto".to_string());
            choices.extend(tags.iter().cloned());
            outbounds.push(json!({
                "type": "selector",
                "tag": "proxy",
                "outbounds": choices,
                "default": "proxy-auto",
            }));
        }
    }

    let mut route = Map::new();
    route.insert("final".to_string(), json!("proxy"));
    if routing.bypass_private_enabled {
        let mut rules = Vec::new();
        if !routing.bypass_domains.is_empty() {
            rules.push(json!({
                "domain_suffix": routing.bypass_domains,
                "outbound": "direct",
            }));
        }
        if !routing.bypass_cidrs.is_empty() {
            rules.push(json!({
                "ip_cidr": routing.bypass_cidrs,
                "outbound": "direct",
            }));
        }
        if !rules.is_empty() {
            route.insert("rules".to_string(), Value::Array(rules));
        }
    }

    let mut cfg = Map::new();
    cfg.insert("inbounds".to_string(), Value::Array(inbounds));
    cfg.insert("outbounds".to_string(), Value::Array(outbounds));
    cfg.insert("route".to_string(), Value::Object(route));
    if let Some(controller) = controller {
        let mut clash_api = Map::new();
        clash_api.insert(
            "external_controller".to_string(),
            json!(controller.external_controller),
        );
        if let Some(secret) = &controller.secret {
            clash_api.insert("secret".to_string(), json!(secret));
        }
        let mut experimental = Map::new();
        experimental.insert("clash_api".to_string(), Value::Object(clash_api));
        cfg.insert("experimental".to_string(), Value::Object(experimental));
    }

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    serde::Serialize::serialize(&Value::Object(cfg), &mut ser)
        .map_err(|_| Error::new("CFG_JSON_INVALID", "marshal config"))?;
    Ok(buf)
}

fn build_inbound(kind: &str, tag: &str, p: &ProxyInbound) -> Value {
    let mut inb = Map::new();
    inb.insert("type".to_string(), json!(kind));
    inb.insert("tag".to_string(), json!(tag));
    inb.insert("listen".to_string(), json!(p.listen_address));
    inb.insert("listen_port".to_string(), json!(p.port));
    inb.insert("sniff".to_string(), json!(true));
    if p.auth_mode == "basic" && !p.username.is_empty() && !p.password.is_empty() {
        inb.insert(
            "users".to_string(),
            json!([{"username": p.username, "password": p.password}]),
        );
    }
    Value::Object(inb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(enabled: bool) -> ProxyInbound {
        ProxyInbound {
            listen_address: "0.0.0.0".to_string(),
            port: 7890,
            enabled,
            auth_mode: "none".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }

    #[test]
    fn no_nodes_yields_direct_default_selector() {
        let bytes = synth(
            &inbound(true),
            &inbound(true),
            &RoutingSettings::default(),
            &[],
            None,
        )
        .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        let selector = value["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["tag"] == "proxy")
            .unwrap();
        assert_eq!(selector["type"], "selector");
        assert_eq!(selector["default"], "direct");
        assert_eq!(selector["outbounds"], json!(["direct"]));
    }

    #[test]
    fn two_or_more_nodes_get_urltest_plus_selector() {
        let nodes = vec![
            r#"{"type":"vmess","tag":"a","server":"1.1.1.1","server_port":443,"uuid":"x"}"#
                .to_string(),
            r#"{"type":"vmess","tag":"b","server":"2.2.2.2","server_port":443,"uuid":"y"}"#
                .to_string(),
        ];
        let bytes = synth(
            &inbound(true),
            &inbound(false),
            &RoutingSettings::default(),
            &nodes,
            None,
        )
        .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        let outbounds = value["outbounds"].as_array().unwrap();
        assert!(outbounds.iter().any(|o| o["type"] == "urltest" && o["tag"] == "proxy-auto"));
        let selector = outbounds.iter().find(|o| o["tag"] == "proxy").unwrap();
        assert_eq!(selector["default"], "proxy-auto");
        assert_eq!(value["inbounds"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn malformed_node_json_is_skipped_not_fatal() {
        let nodes = vec!["not json".to_string()];
        let bytes = synth(
            &inbound(false),
            &inbound(false),
            &RoutingSettings::default(),
            &nodes,
            None,
        )
        .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["outbounds"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn identical_input_is_byte_identical() {
        let a = synth(&inbound(true), &inbound(true), &RoutingSettings::default(), &[], None)
            .unwrap();
        let b = synth(&inbound(true), &inbound(true), &RoutingSettings::default(), &[], None)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn bypass_rules_ordered_domain_then_cidr() {
        let bytes = synth(
            &inbound(false),
            &inbound(false),
            &RoutingSettings::default(),
            &[],
            None,
        )
        .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        let rules = value["route"]["rules"].as_array().unwrap();
        assert!(rules[0].get("domain_suffix").is_some());
        assert!(rules[1].get("ip_cidr").is_some());
    }
}
