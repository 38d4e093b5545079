//! Subscription CRUD and fetch-result bookkeeping.

use relaybox_core::{now_rfc3339, Error, RowId};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// A stored subscription row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRow {
    pub id: String,
    pub name: String,
    pub url: String,
    pub kind: String,
    pub enabled: bool,
    pub auto_update_enabled: bool,
    pub refresh_interval_sec: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetch_at: Option<String>,
    pub last_success_at: Option<String>,
    pub last_error: Option<String>,
    pub upload_bytes: Option<i64>,
    pub download_bytes: Option<i64>,
    pub total_bytes: Option<i64>,
    pub expire_unix: Option<i64>,
    pub userinfo_raw: Option<String>,
    pub profile_web_page: Option<String>,
    pub profile_update_interval_sec: Option<i64>,
    pub userinfo_updated_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields upserted by a usage-metadata update (§4.2 step 11).
#[derive(Debug, Clone, Default)]
pub struct UsageMetadata {
    pub upload_bytes: Option<i64>,
    pub download_bytes: Option<i64>,
    pub total_bytes: Option<i64>,
    pub expire_unix: Option<i64>,
    pub userinfo_raw: Option<String>,
    pub profile_web_page: Option<String>,
    pub profile_update_interval_sec: Option<i64>,
}

fn row_from(row: &sqlx::sqlite::SqliteRow) -> SubscriptionRow {
    SubscriptionRow {
        id: row.get("id"),
        name: row.get("name"),
        url: row.get("url"),
        kind: row.get("type"),
        enabled: row.get::<i64, _>("enabled") != 0,
        auto_update_enabled: row.get::<i64, _>("auto_update_enabled") != 0,
        refresh_interval_sec: row.get("refresh_interval_sec"),
        etag: row.get("etag"),
        last_modified: row.get("last_modified"),
        last_fetch_at: row.get("last_fetch_at"),
        last_success_at: row.get("last_success_at"),
        last_error: row.get("last_error"),
        upload_bytes: row.get("upload_bytes"),
        download_bytes: row.get("download_bytes"),
        total_bytes: row.get("total_bytes"),
        expire_unix: row.get("expire_unix"),
        userinfo_raw: row.get("userinfo_raw"),
        profile_web_page: row.get("profile_web_page"),
        profile_update_interval_sec: row.get("profile_update_interval_sec"),
        userinfo_updated_at: row.get("userinfo_updated_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Lists subscriptions, optionally restricted to enabled ones.
pub async fn list(pool: &SqlitePool, only_enabled: bool) -> Result<Vec<SubscriptionRow>, Error> {
    let query = if only_enabled {
        "SELECT * FROM subscriptions WHERE enabled = 1 ORDER BY created_at"
    } else {
        "SELECT * FROM subscriptions ORDER BY created_at"
    };
    let rows = sqlx::query(query)
        .fetch_all(pool)
        .await
        .map_err(Error::db)?;
    Ok(rows.iter().map(row_from).collect())
}

/// Loads a single subscription by id.
pub async fn get(pool: &SqlitePool, id: &str) -> Result<SubscriptionRow, Error> {
    let row = sqlx::query("SELECT * FROM subscriptions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(Error::db)?
        .ok_or_else(|| Error::not_found("SUB_NOT_FOUND", format!("subscription {id} not found")))?;
    Ok(row_from(&row))
}

/// Creates a new subscription row, returning its fresh id.
pub async fn create(
    pool: &SqlitePool,
    name: &str,
    url: &str,
    kind: &str,
    refresh_interval_sec: i64,
) -> Result<RowId, Error> {
    let id = RowId::new();
    let now = now_rfc3339();
    let interval = if refresh_interval_sec < 60 {
        3600
    } else {
        refresh_interval_sec
    };
    sqlx::query(
        "INSERT INTO subscriptions (id, name, url, type, enabled, auto_update_enabled, \
         refresh_interval_sec, created_at, updated_at) VALUES (?, ?, ?, ?, 1, 1, ?, ?, ?)",
    )
    .bind(id.as_str())
    .bind(name)
    .bind(url)
    .bind(kind)
    .bind(interval)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(Error::db)?;
    Ok(id)
}

/// Partially updates a subscription's user-editable fields.
pub async fn update(
    pool: &SqlitePool,
    id: &str,
    name: Option<&str>,
    url: Option<&str>,
    enabled: Option<bool>,
    auto_update_enabled: Option<bool>,
    refresh_interval_sec: Option<i64>,
) -> Result<(), Error> {
    let now = now_rfc3339();
    sqlx::query(
        "UPDATE subscriptions SET \
         name = COALESCE(?, name), \
         url = COALESCE(?, url), \
         enabled = COALESCE(?, enabled), \
         auto_update_enabled = COALESCE(?, auto_update_enabled), \
         refresh_interval_sec = COALESCE(?, refresh_interval_sec), \
         updated_at = ? \
         WHERE id = ?",
    )
    .bind(name)
    .bind(url)
    .bind(enabled.map(i64::from))
    .bind(auto_update_enabled.map(i64::from))
    .bind(refresh_interval_sec)
    .bind(&now)
    .bind(id)
    .execute(pool)
    .await
    .map_err(Error::db)?;
    Ok(())
}

/// Deletes a subscription and all its nodes in one transaction.
pub async fn delete_cascade(pool: &SqlitePool, id: &str) -> Result<(), Error> {
    let mut tx = pool.begin().await.map_err(Error::db)?;
    sqlx::query("DELETE FROM nodes WHERE sub_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(Error::db)?;
    sqlx::query("DELETE FROM subscriptions WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(Error::db)?;
    tx.commit().await.map_err(Error::db)?;
    Ok(())
}

/// Records the outcome of a fetch attempt: HTTP validators on any
/// attempt, `last_success_at` only when `success` is true.
pub async fn set_fetch_result(
    pool: &SqlitePool,
    id: &str,
    etag: Option<&str>,
    last_modified: Option<&str>,
    last_error: Option<&str>,
    success: bool,
) -> Result<(), Error> {
    let now = now_rfc3339();
    if success {
        sqlx::query(
            "UPDATE subscriptions SET etag = ?, last_modified = ?, last_error = NULL, \
             last_fetch_at = ?, last_success_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(etag)
        .bind(last_modified)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(Error::db)?;
    } else {
        sqlx::query(
            "UPDATE subscriptions SET etag = COALESCE(?, etag), \
             last_modified = COALESCE(?, last_modified), last_error = ?, \
             last_fetch_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(etag)
        .bind(last_modified)
        .bind(last_error)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(Error::db)?;
    }
    Ok(())
}

/// Persists parsed `subscription-userinfo`/profile headers. On a legacy
/// database missing these columns, the write is silently skipped; every
/// other failure propagates.
pub async fn record_usage_metadata(
    pool: &SqlitePool,
    id: &str,
    usage: &UsageMetadata,
) -> Result<(), Error> {
    let now = now_rfc3339();
    let result = sqlx::query(
        "UPDATE subscriptions SET upload_bytes = COALESCE(?, upload_bytes), \
         download_bytes = COALESCE(?, download_bytes), total_bytes = COALESCE(?, total_bytes), \
         expire_unix = COALESCE(?, expire_unix), userinfo_raw = COALESCE(?, userinfo_raw), \
         profile_web_page = COALESCE(?, profile_web_page), \
         profile_update_interval_sec = COALESCE(?, profile_update_interval_sec), \
         userinfo_updated_at = ? WHERE id = ?",
    )
    .bind(usage.upload_bytes)
    .bind(usage.download_bytes)
    .bind(usage.total_bytes)
    .bind(usage.expire_unix)
    .bind(&usage.userinfo_raw)
    .bind(&usage.profile_web_page)
    .bind(usage.profile_update_interval_sec)
    .bind(&now)
    .bind(id)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if crate::is_missing_column_error(&e) => Ok(()),
        Err(e) => Err(Error::db(e)),
    }
}
