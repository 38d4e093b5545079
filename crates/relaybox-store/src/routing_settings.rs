//! The singleton bypass-routing settings row.

use relaybox_core::{now_rfc3339, Error};
use relaybox_synth::RoutingSettings;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

const SINGLETON_ID: &str = "global";

/// Loads the routing settings, falling back to the engine's documented
/// defaults (private-network bypass enabled) when no row exists yet.
pub async fn load(pool: &SqlitePool) -> Result<RoutingSettings, Error> {
    let row = sqlx::query("SELECT * FROM routing_settings WHERE id = ?")
        .bind(SINGLETON_ID)
        .fetch_optional(pool)
        .await
        .map_err(Error::db)?;
    let Some(row) = row else {
        return Ok(RoutingSettings::default());
    };
    let bypass_private_enabled: i64 = row.get("bypass_private_enabled");
    let domains_json: String = row.get("bypass_domains_json");
    let cidrs_json: String = row.get("bypass_cidrs_json");
    Ok(RoutingSettings {
        bypass_private_enabled: bypass_private_enabled != 0,
        bypass_domains: serde_json::from_str(&domains_json).unwrap_or_default(),
        bypass_cidrs: serde_json::from_str(&cidrs_json).unwrap_or_default(),
    })
}

/// Validates CIDR-shaped strings and persists the routing settings.
/// `bypass_domains`/`bypass_cidrs` are trimmed and de-duplicated in place,
/// preserving first-seen order.
pub async fn save(pool: &SqlitePool, settings: &RoutingSettings) -> Result<(), Error> {
    for cidr in &settings.bypass_cidrs {
        if parse_cidr(cidr).is_none() {
            return Err(
                Error::new("REQ_INVALID_FIELD", format!("invalid CIDR: {cidr}"))
                    .with_detail("field", "bypass_cidrs")
                    .with_detail("value", cidr.clone()),
            );
        }
    }

    let domains = normalize_string_list(&settings.bypass_domains);
    let cidrs = normalize_string_list(&settings.bypass_cidrs);
    let now = now_rfc3339();
    sqlx::query(
        "INSERT INTO routing_settings (id, bypass_private_enabled, bypass_domains_json, \
         bypass_cidrs_json, updated_at) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET bypass_private_enabled = excluded.bypass_private_enabled, \
         bypass_domains_json = excluded.bypass_domains_json, \
         bypass_cidrs_json = excluded.bypass_cidrs_json, updated_at = excluded.updated_at",
    )
    .bind(SINGLETON_ID)
    .bind(i64::from(settings.bypass_private_enabled))
    .bind(serde_json::to_string(&domains).unwrap_or_else(|_| "[]".to_string()))
    .bind(serde_json::to_string(&cidrs).unwrap_or_else(|_| "[]".to_string()))
    .bind(&now)
    .execute(pool)
    .await
    .map_err(Error::db)?;
    Ok(())
}

fn normalize_string_list(values: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() || !seen.insert(trimmed.to_string()) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

/// Minimal CIDR syntax check (IPv4 or IPv6 network/prefix-length),
/// equivalent to the original's use of `net.ParseCIDR`.
fn parse_cidr(value: &str) -> Option<()> {
    let (addr, prefix) = value.split_once('/')?;
    let prefix_len: u32 = prefix.parse().ok()?;
    if addr.parse::<std::net::Ipv4Addr>().is_ok() {
        (prefix_len <= 32).then_some(())
    } else if addr.parse::<std::net::Ipv6Addr>().is_ok() {
        (prefix_len <= 128).then_some(())
    } else {
        None
    }
}
