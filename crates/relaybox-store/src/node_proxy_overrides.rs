//! Per-node inbound overrides. Dormant per the synthesiser's contract —
//! stored for the external surface to manage, never read during synthesis.

use relaybox_core::{now_rfc3339, Error, RowId};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;

/// A stored override row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProxyOverrideRow {
    pub id: String,
    pub node_id: String,
    pub proxy_type: String,
    pub enabled: bool,
    pub listen_address: Option<String>,
    pub port: Option<i64>,
    pub auth_mode: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn row_from(row: &SqliteRow) -> NodeProxyOverrideRow {
    NodeProxyOverrideRow {
        id: row.get("id"),
        node_id: row.get("node_id"),
        proxy_type: row.get("proxy_type"),
        enabled: row.get::<i64, _>("enabled") != 0,
        listen_address: row.get("listen_address"),
        port: row.get("port"),
        auth_mode: row.get("auth_mode"),
        username: row.get("username"),
        password: row.get("password"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Loads every override for a node, keyed by `proxy_type`.
pub async fn get_for_node(
    pool: &SqlitePool,
    node_id: &str,
) -> Result<HashMap<String, NodeProxyOverrideRow>, Error> {
    let rows = sqlx::query("SELECT * FROM node_proxy_overrides WHERE node_id = ?")
        .bind(node_id)
        .fetch_all(pool)
        .await
        .map_err(Error::db)?;
    Ok(rows
        .iter()
        .map(row_from)
        .map(|r| (r.proxy_type.clone(), r))
        .collect())
}

/// Upserts an override for `(node_id, proxy_type)`.
#[allow(clippy::too_many_arguments)]
pub async fn upsert(
    pool: &SqlitePool,
    node_id: &str,
    proxy_type: &str,
    enabled: bool,
    listen_address: Option<&str>,
    port: Option<i64>,
    auth_mode: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<(), Error> {
    let now = now_rfc3339();
    let id = RowId::new();
    sqlx::query(
        "INSERT INTO node_proxy_overrides (id, node_id, proxy_type, enabled, listen_address, \
         port, auth_mode, username, password, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(node_id, proxy_type) DO UPDATE SET enabled = excluded.enabled, \
         listen_address = excluded.listen_address, port = excluded.port, \
         auth_mode = excluded.auth_mode, username = excluded.username, \
         password = excluded.password, updated_at = excluded.updated_at",
    )
    .bind(id.as_str())
    .bind(node_id)
    .bind(proxy_type)
    .bind(i64::from(enabled))
    .bind(listen_address)
    .bind(port)
    .bind(auth_mode)
    .bind(username)
    .bind(password)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(Error::db)?;
    Ok(())
}

/// Deletes an override, restoring inheritance from the global setting.
pub async fn delete(pool: &SqlitePool, node_id: &str, proxy_type: &str) -> Result<(), Error> {
    sqlx::query("DELETE FROM node_proxy_overrides WHERE node_id = ? AND proxy_type = ?")
        .bind(node_id)
        .bind(proxy_type)
        .execute(pool)
        .await
        .map_err(Error::db)?;
    Ok(())
}
