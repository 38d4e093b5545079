//! Node CRUD and the transactional subscription-replace operation.

use relaybox_core::{now_rfc3339, Error, RowId};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;

/// A stored node row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: String,
    pub sub_id: String,
    pub tag: String,
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub forwarding_enabled: bool,
    pub outbound_json: String,
    pub created_at: String,
    pub last_test_at: Option<String>,
    pub last_latency_ms: Option<i64>,
    pub last_test_status: String,
    pub last_test_error: Option<String>,
}

/// A freshly parsed outbound awaiting insertion, prior to the
/// `forwarding_enabled` preservation performed by [`replace_for_subscription`].
#[derive(Debug, Clone)]
pub struct NewNode {
    pub tag: String,
    pub name: String,
    pub kind: String,
    pub outbound_json: String,
}

fn row_from(row: &SqliteRow) -> NodeRow {
    NodeRow {
        id: row.get("id"),
        sub_id: row.get("sub_id"),
        tag: row.get("tag"),
        name: row.get("name"),
        kind: row.get("type"),
        enabled: row.get::<i64, _>("enabled") != 0,
        forwarding_enabled: row.get::<i64, _>("forwarding_enabled") != 0,
        outbound_json: row.get("outbound_json"),
        created_at: row.get("created_at"),
        last_test_at: row.get("last_test_at"),
        last_latency_ms: row.get("last_latency_ms"),
        last_test_status: row.get("last_test_status"),
        last_test_error: row.get("last_test_error"),
    }
}

/// Lists every node across every subscription, newest-created first.
/// Used by the external surface's unscoped node listing.
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<NodeRow>, Error> {
    let rows = sqlx::query("SELECT * FROM nodes ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .map_err(Error::db)?;
    Ok(rows.iter().map(row_from).collect())
}

/// Lists nodes for a subscription, optionally restricted by `enabled`.
pub async fn list(
    pool: &SqlitePool,
    sub_id: &str,
    enabled: Option<bool>,
) -> Result<Vec<NodeRow>, Error> {
    let rows = match enabled {
        Some(flag) => {
            sqlx::query("SELECT * FROM nodes WHERE sub_id = ? AND enabled = ? ORDER BY tag")
                .bind(sub_id)
                .bind(i64::from(flag))
                .fetch_all(pool)
                .await
        }
        None => {
            sqlx::query("SELECT * FROM nodes WHERE sub_id = ? ORDER BY tag")
                .bind(sub_id)
                .fetch_all(pool)
                .await
        }
    }
    .map_err(Error::db)?;
    Ok(rows.iter().map(row_from).collect())
}

/// Lists every enabled node with forwarding enabled, across all
/// subscriptions — the input to the apply pipeline's `Load` step.
pub async fn list_enabled_forwarding(pool: &SqlitePool) -> Result<Vec<NodeRow>, Error> {
    let rows = sqlx::query(
        "SELECT * FROM nodes WHERE enabled = 1 AND forwarding_enabled = 1 ORDER BY tag",
    )
    .fetch_all(pool)
    .await
    .map_err(Error::db)?;
    Ok(rows.iter().map(row_from).collect())
}

/// Loads a single node by id.
pub async fn get(pool: &SqlitePool, id: &str) -> Result<NodeRow, Error> {
    let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(Error::db)?
        .ok_or_else(|| Error::not_found("NODE_NOT_FOUND", format!("node {id} not found")))?;
    Ok(row_from(&row))
}

/// Replaces every node of `sub_id` with `new_nodes`, in one transaction:
/// snapshots the old `(tag -> forwarding_enabled)` mapping before
/// deleting, then re-inserts with that value restored wherever the tag
/// reappears. Probe fields (`last_test_*`) always reset on replacement.
/// Assigns `tag = <given tag> or "<first8(sub_id)>-<index>-node"` when a
/// parsed outbound carried no tag of its own.
pub async fn replace_for_subscription(
    pool: &SqlitePool,
    sub_id: &str,
    new_nodes: &[NewNode],
) -> Result<(), Error> {
    let mut tx = pool.begin().await.map_err(Error::db)?;

    let old_rows = sqlx::query("SELECT tag, forwarding_enabled FROM nodes WHERE sub_id = ?")
        .bind(sub_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::db)?;
    let mut old_forwarding: HashMap<String, bool> = HashMap::new();
    for row in &old_rows {
        let tag: String = row.get("tag");
        let forwarding: i64 = row.get("forwarding_enabled");
        old_forwarding.insert(tag, forwarding != 0);
    }

    sqlx::query("DELETE FROM nodes WHERE sub_id = ?")
        .bind(sub_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::db)?;

    let sub_prefix: String = sub_id.chars().take(8).collect();
    let now = now_rfc3339();
    for (index, new_node) in new_nodes.iter().enumerate() {
        let tag = if new_node.tag.is_empty() {
            format!("{sub_prefix}-{index}-node")
        } else {
            new_node.tag.clone()
        };
        let forwarding_enabled = old_forwarding.get(&tag).copied().unwrap_or(false);
        let name = if new_node.name.is_empty() {
            tag.clone()
        } else {
            new_node.name.clone()
        };
        let id = RowId::new();
        sqlx::query(
            "INSERT INTO nodes (id, sub_id, tag, name, type, enabled, forwarding_enabled, \
             outbound_json, created_at, last_test_status) VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?, '')",
        )
        .bind(id.as_str())
        .bind(sub_id)
        .bind(&tag)
        .bind(&name)
        .bind(&new_node.kind)
        .bind(i64::from(forwarding_enabled))
        .bind(&new_node.outbound_json)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(Error::db)?;
    }

    tx.commit().await.map_err(Error::db)?;
    Ok(())
}

/// Updates a node's `enabled`/`forwarding_enabled` flags.
pub async fn update_flags(
    pool: &SqlitePool,
    id: &str,
    enabled: Option<bool>,
    forwarding_enabled: Option<bool>,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE nodes SET enabled = COALESCE(?, enabled), \
         forwarding_enabled = COALESCE(?, forwarding_enabled) WHERE id = ?",
    )
    .bind(enabled.map(i64::from))
    .bind(forwarding_enabled.map(i64::from))
    .bind(id)
    .execute(pool)
    .await
    .map_err(Error::db)?;
    Ok(())
}

/// Records a probe outcome against one node.
pub async fn set_probe_result(
    pool: &SqlitePool,
    id: &str,
    status: &str,
    latency_ms: Option<i64>,
    error: Option<&str>,
) -> Result<(), Error> {
    let now = now_rfc3339();
    sqlx::query(
        "UPDATE nodes SET last_test_at = ?, last_latency_ms = ?, last_test_status = ?, \
         last_test_error = ? WHERE id = ?",
    )
    .bind(&now)
    .bind(latency_ms)
    .bind(status)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .map_err(Error::db)?;
    Ok(())
}
