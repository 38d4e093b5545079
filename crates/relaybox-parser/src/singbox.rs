//! Parses a sing-box style payload: either a bare JSON array of outbound
//! objects, or an object carrying an `outbounds` array.

use crate::model::{is_filtered_type, OutboundItem};
use relaybox_core::Error;
use serde_json::Value;

/// `Some(Ok(items))` if the payload was recognised as sing-box JSON and
/// parsed without error, `Some(Err(_))` if recognised but malformed in a
/// way that should fail the whole subscription, `None` if the payload
/// isn't sing-box JSON at all (so the caller should try the next stage).
pub fn try_parse(payload: &[u8]) -> Option<Result<Vec<OutboundItem>, Error>> {
    if let Ok(Value::Array(arr)) = serde_json::from_slice::<Value>(payload) {
        if arr.is_empty() {
            return Some(Ok(Vec::new()));
        }
        return Some(Ok(parse_array(&arr)));
    }

    #[derive(serde::Deserialize)]
    struct Wrapper {
        #[serde(default)]
        outbounds: Vec<Value>,
    }
    match serde_json::from_slice::<Wrapper>(payload) {
        Ok(wrapper) => Some(Ok(parse_array(&wrapper.outbounds))),
        Err(_) => None,
    }
}

fn parse_array(arr: &[Value]) -> Vec<OutboundItem> {
    let mut out = Vec::with_capacity(arr.len());
    for entry in arr {
        let Value::Object(map) = entry else {
            continue;
        };
        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_lowercase();
        if kind.is_empty() || is_filtered_type(&kind) {
            continue;
        }
        let tag = map
            .get("tag")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        out.push(OutboundItem {
            tag,
            kind,
            raw: entry.clone(),
        });
    }
    out
}
