//! Global HTTP/SOCKS inbound settings, one row per proxy type.

use relaybox_core::{now_rfc3339, Error};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;

/// A stored inbound settings row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettingsRow {
    pub proxy_type: String,
    pub enabled: bool,
    pub listen_address: String,
    pub port: i64,
    pub auth_mode: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub updated_at: String,
}

fn row_from(row: &SqliteRow) -> ProxySettingsRow {
    ProxySettingsRow {
        proxy_type: row.get("proxy_type"),
        enabled: row.get::<i64, _>("enabled") != 0,
        listen_address: row.get("listen_address"),
        port: row.get("port"),
        auth_mode: row.get("auth_mode"),
        username: row.get("username"),
        password: row.get("password"),
        updated_at: row.get("updated_at"),
    }
}

/// Loads every inbound settings row, keyed by `proxy_type`.
pub async fn get_all(pool: &SqlitePool) -> Result<HashMap<String, ProxySettingsRow>, Error> {
    let rows = sqlx::query("SELECT * FROM proxy_settings")
        .fetch_all(pool)
        .await
        .map_err(Error::db)?;
    Ok(rows
        .iter()
        .map(row_from)
        .map(|r| (r.proxy_type.clone(), r))
        .collect())
}

/// Loads one inbound settings row, falling back to a disabled default
/// (`http` listens on 7890, `socks` on 7891, matching the original
/// daemon's defaults) when no row exists yet.
pub async fn get(pool: &SqlitePool, proxy_type: &str) -> Result<ProxySettingsRow, Error> {
    let row = sqlx::query("SELECT * FROM proxy_settings WHERE proxy_type = ?")
        .bind(proxy_type)
        .fetch_optional(pool)
        .await
        .map_err(Error::db)?;
    Ok(match row {
        Some(row) => row_from(&row),
        None => default_for(proxy_type),
    })
}

fn sibling(proxy_type: &str) -> &'static str {
    if proxy_type == "socks" {
        "http"
    } else {
        "socks"
    }
}

fn default_for(proxy_type: &str) -> ProxySettingsRow {
    let port = if proxy_type == "socks" { 7891 } else { 7890 };
    ProxySettingsRow {
        proxy_type: proxy_type.to_string(),
        enabled: false,
        listen_address: "0.0.0.0".to_string(),
        port,
        auth_mode: "none".to_string(),
        username: None,
        password: None,
        updated_at: String::new(),
    }
}

/// Upserts one inbound settings row. Validates the port range, the listen
/// address, and — when the sibling inbound is also enabled — the
/// port/address conflict rule: sharing a port requires distinct listen
/// addresses and neither may be `0.0.0.0`.
pub async fn upsert(
    pool: &SqlitePool,
    proxy_type: &str,
    enabled: bool,
    listen_address: &str,
    port: i64,
    auth_mode: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<(), Error> {
    if !(1..=65535).contains(&port) {
        return Err(Error::invalid_field("port", port.to_string()));
    }
    if listen_address != "127.0.0.1" && listen_address != "0.0.0.0" {
        return Err(Error::invalid_field("listen_address", listen_address));
    }

    if enabled {
        let other_type = sibling(proxy_type);
        let other = get(pool, other_type).await?;
        if other.enabled && other.port == port {
            let conflict = other.listen_address == listen_address
                || listen_address == "0.0.0.0"
                || other.listen_address == "0.0.0.0";
            if conflict {
                return Err(Error::new(
                    "REQ_INVALID_FIELD",
                    "inbound listen address/port conflict",
                )
                .with_detail("proxy_type", proxy_type)
                .with_detail("conflicts_with", other_type));
            }
        }
    }

    let now = now_rfc3339();
    sqlx::query(
        "INSERT INTO proxy_settings (proxy_type, enabled, listen_address, port, auth_mode, \
         username, password, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(proxy_type) DO UPDATE SET enabled = excluded.enabled, \
         listen_address = excluded.listen_address, port = excluded.port, \
         auth_mode = excluded.auth_mode, username = excluded.username, \
         password = excluded.password, updated_at = excluded.updated_at",
    )
    .bind(proxy_type)
    .bind(i64::from(enabled))
    .bind(listen_address)
    .bind(port)
    .bind(auth_mode)
    .bind(username)
    .bind(password)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(Error::db)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        crate::open("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn rejects_shared_port_on_zero_address() {
        let pool = memory_pool().await;
        upsert(&pool, "http", true, "0.0.0.0", 7890, "none", None, None)
            .await
            .unwrap();
        let err = upsert(&pool, "socks", true, "0.0.0.0", 7890, "none", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, "REQ_INVALID_FIELD");
    }

    #[tokio::test]
    async fn shared_port_always_conflicts_given_only_two_valid_addresses() {
        // Only 127.0.0.1 and 0.0.0.0 are valid listen addresses, so a
        // shared port can never satisfy "listen addresses differ and
        // neither is 0.0.0.0" — both allowed combinations conflict.
        let pool = memory_pool().await;
        upsert(&pool, "http", true, "127.0.0.1", 7890, "none", None, None)
            .await
            .unwrap();
        let err = upsert(&pool, "socks", true, "127.0.0.1", 7890, "none", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, "REQ_INVALID_FIELD");
    }

    #[tokio::test]
    async fn distinct_ports_never_conflict() {
        let pool = memory_pool().await;
        upsert(&pool, "http", true, "0.0.0.0", 7890, "none", None, None)
            .await
            .unwrap();
        upsert(&pool, "socks", true, "0.0.0.0", 7891, "none", None, None)
            .await
            .unwrap();
    }
}
