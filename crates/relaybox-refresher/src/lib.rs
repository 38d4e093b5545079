//! Subscription refresh: conditional GET, size-capped body read, format
//! detection via `relaybox-parser`, and transactional node replacement
//! that preserves per-node `forwarding_enabled` across the swap.

use futures::StreamExt;
use relaybox_core::Error;
use relaybox_store::nodes::NewNode;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::time::Duration;

/// Hard cap on subscription response bodies.
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;
/// Overall deadline for the subscription fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a single [`refresh`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub not_modified: bool,
    pub nodes_total: usize,
    pub nodes_enabled: usize,
}

/// Refreshes one subscription: fetches its URL with conditional-GET
/// validators, parses the body, and atomically replaces its node set.
/// See spec.md §4.2 for the full step-by-step contract.
pub async fn refresh(pool: &SqlitePool, sub_id: &str) -> Result<RefreshOutcome, Error> {
    let sub = relaybox_store::subscriptions::get(pool, sub_id).await?;

    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| Error::new("SUB_FETCH_FAILED", e.to_string()))?;

    let mut request = client.get(&sub.url);
    if let Some(etag) = sub.etag.as_deref().filter(|v| !v.is_empty()) {
        request = request.header("If-None-Match", etag);
    }
    if let Some(last_modified) = sub.last_modified.as_deref().filter(|v| !v.is_empty()) {
        request = request.header("If-Modified-Since", last_modified);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            relaybox_store::subscriptions::set_fetch_result(
                pool,
                sub_id,
                sub.etag.as_deref(),
                sub.last_modified.as_deref(),
                Some(&e.to_string()),
                false,
            )
            .await?;
            return Err(Error::new("SUB_FETCH_FAILED", e.to_string()));
        }
    };

    if response.status() == StatusCode::NOT_MODIFIED {
        relaybox_store::subscriptions::set_fetch_result(
            pool,
            sub_id,
            sub.etag.as_deref(),
            sub.last_modified.as_deref(),
            None,
            false,
        )
        .await?;
        return Ok(RefreshOutcome {
            not_modified: true,
            nodes_total: 0,
            nodes_enabled: 0,
        });
    }

    if !response.status().is_success() {
        let status = response.status().to_string();
        relaybox_store::subscriptions::set_fetch_result(
            pool,
            sub_id,
            sub.etag.as_deref(),
            sub.last_modified.as_deref(),
            Some(&status),
            false,
        )
        .await?;
        return Err(
            Error::new("SUB_HTTP_STATUS_ERROR", "subscription fetch returned non-200")
                .with_detail("status", status),
        );
    }

    let etag = response
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_modified = response
        .headers()
        .get("last-modified")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let usage_header = response
        .headers()
        .get("subscription-userinfo")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let profile_web_page = response
        .headers()
        .get("profile-web-page")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let profile_update_interval = response
        .headers()
        .get("profile-update-interval")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0);

    let body = match read_capped(response, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            relaybox_store::subscriptions::set_fetch_result(
                pool,
                sub_id,
                etag.as_deref(),
                last_modified.as_deref(),
                Some(&e.to_string()),
                false,
            )
            .await?;
            return Err(Error::new("SUB_FETCH_FAILED", e.to_string()));
        }
    };

    let outbounds = match relaybox_parser::parse_subscription(&body) {
        Ok(outbounds) => outbounds,
        Err(e) => {
            relaybox_store::subscriptions::set_fetch_result(
                pool,
                sub_id,
                etag.as_deref(),
                last_modified.as_deref(),
                Some(&e.message),
                false,
            )
            .await?;
            return Err(e);
        }
    };

    let new_nodes: Vec<NewNode> = outbounds
        .into_iter()
        .map(|o| NewNode {
            tag: o.tag.clone(),
            name: o.tag,
            kind: o.kind,
            outbound_json: o.raw.to_string(),
        })
        .collect();

    relaybox_store::nodes::replace_for_subscription(pool, sub_id, &new_nodes)
        .await
        .map_err(|_| Error::new("SUB_REPLACE_NODES_FAILED", "failed to replace nodes"))?;

    relaybox_store::subscriptions::set_fetch_result(
        pool,
        sub_id,
        etag.as_deref(),
        last_modified.as_deref(),
        None,
        true,
    )
    .await?;

    if let Some(usage) = usage_header.as_deref().map(parse_userinfo_header) {
        let mut usage = usage;
        usage.profile_web_page = profile_web_page;
        usage.profile_update_interval_sec = profile_update_interval;
        relaybox_store::subscriptions::record_usage_metadata(pool, sub_id, &usage).await?;
    } else if profile_web_page.is_some() || profile_update_interval.is_some() {
        let usage = relaybox_store::subscriptions::UsageMetadata {
            profile_web_page,
            profile_update_interval_sec: profile_update_interval,
            ..Default::default()
        };
        relaybox_store::subscriptions::record_usage_metadata(pool, sub_id, &usage).await?;
    }

    let total = new_nodes.len();
    Ok(RefreshOutcome {
        not_modified: false,
        nodes_total: total,
        nodes_enabled: total,
    })
}

async fn read_capped(response: reqwest::Response, max: usize) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::new("SUB_FETCH_FAILED", e.to_string()))?;
        let remaining = max.saturating_sub(buf.len());
        if remaining == 0 {
            break;
        }
        let take = remaining.min(chunk.len());
        buf.extend_from_slice(&chunk[..take]);
        if buf.len() >= max {
            break;
        }
    }
    Ok(buf)
}

/// Parses the `subscription-userinfo` header: semicolon-separated
/// `key=value` pairs with keys `upload`, `download`, `total`, `expire`.
fn parse_userinfo_header(raw: &str) -> relaybox_store::subscriptions::UsageMetadata {
    let mut usage = relaybox_store::subscriptions::UsageMetadata {
        userinfo_raw: Some(raw.to_string()),
        ..Default::default()
    };
    for pair in raw.split(';') {
        let pair = pair.trim();
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<i64>() else {
            continue;
        };
        if value < 0 {
            continue;
        }
        match key.trim() {
            "upload" => usage.upload_bytes = Some(value),
            "download" => usage.download_bytes = Some(value),
            "total" => usage.total_bytes = Some(value),
            "expire" => usage.expire_unix = Some(value),
            _ => {}
        }
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_userinfo_header_fields() {
        let usage = parse_userinfo_header("upload=100; download=200; total=300; expire=9999");
        assert_eq!(usage.upload_bytes, Some(100));
        assert_eq!(usage.download_bytes, Some(200));
        assert_eq!(usage.total_bytes, Some(300));
        assert_eq!(usage.expire_unix, Some(9999));
    }

    #[test]
    fn negative_values_are_ignored() {
        let usage = parse_userinfo_header("upload=-5");
        assert!(usage.upload_bytes.is_none());
    }

    #[test]
    fn malformed_pairs_are_skipped() {
        let usage = parse_userinfo_header("garbage;upload=10");
        assert_eq!(usage.upload_bytes, Some(10));
    }

    #[tokio::test]
    async fn refresh_missing_subscription_fails_not_found() {
        let pool = relaybox_store::open("sqlite::memory:").await.unwrap();
        let err = refresh(&pool, "does-not-exist").await.unwrap_err();
        assert_eq!(err.code, "SUB_NOT_FOUND");
    }
}
