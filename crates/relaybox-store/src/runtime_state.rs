//! The singleton runtime-state row the apply pipeline reads and advances.

use relaybox_core::{now_rfc3339, Error};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

const SINGLETON_ID: &str = "runtime";

/// A snapshot of the runtime state row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStateRow {
    pub config_version: i64,
    pub config_hash: String,
    pub forwarding_running: bool,
    pub last_nodes_included: i64,
    pub last_apply_duration_ms: Option<i64>,
    pub last_reload_at: Option<String>,
    pub last_apply_success_at: Option<String>,
    pub last_reload_error: Option<String>,
}

impl Default for RuntimeStateRow {
    fn default() -> Self {
        Self {
            config_version: 0,
            config_hash: String::new(),
            forwarding_running: false,
            last_nodes_included: 0,
            last_apply_duration_ms: None,
            last_reload_at: None,
            last_apply_success_at: None,
            last_reload_error: None,
        }
    }
}

/// Loads the runtime state row, falling back to the all-zero default
/// (no apply has ever succeeded) when no row exists yet.
pub async fn load(pool: &SqlitePool) -> Result<RuntimeStateRow, Error> {
    let row = sqlx::query("SELECT * FROM runtime_state WHERE id = ?")
        .bind(SINGLETON_ID)
        .fetch_optional(pool)
        .await
        .map_err(Error::db)?;
    let Some(row) = row else {
        return Ok(RuntimeStateRow::default());
    };
    let forwarding_running: i64 = row.get("forwarding_running");
    Ok(RuntimeStateRow {
        config_version: row.get("config_version"),
        config_hash: row.get("config_hash"),
        forwarding_running: forwarding_running != 0,
        last_nodes_included: row.get("last_nodes_included"),
        last_apply_duration_ms: row.get("last_apply_duration_ms"),
        last_reload_at: row.get("last_reload_at"),
        last_apply_success_at: row.get("last_apply_success_at"),
        last_reload_error: row.get("last_reload_error"),
    })
}

/// Sets `forwarding_running`, the operator-intent flag the apply pipeline
/// reads on its next `Load` step; leaves every other column untouched.
pub async fn set_forwarding_running(pool: &SqlitePool, running: bool) -> Result<(), Error> {
    ensure_row(pool).await?;
    sqlx::query("UPDATE runtime_state SET forwarding_running = ? WHERE id = ?")
        .bind(i64::from(running))
        .bind(SINGLETON_ID)
        .execute(pool)
        .await
        .map_err(Error::db)?;
    Ok(())
}

/// Records a successful apply: bumps `config_version` by exactly one,
/// stores the new hash, and sets both `last_reload_at` and
/// `last_apply_success_at` to the same instant, clearing any previous error.
pub async fn record_success(
    pool: &SqlitePool,
    new_version: i64,
    config_hash: &str,
    nodes_included: i64,
    duration_ms: i64,
) -> Result<(), Error> {
    ensure_row(pool).await?;
    let now = now_rfc3339();
    sqlx::query(
        "UPDATE runtime_state SET config_version = ?, config_hash = ?, \
         last_nodes_included = ?, last_apply_duration_ms = ?, last_reload_at = ?, \
         last_apply_success_at = ?, last_reload_error = NULL WHERE id = ?",
    )
    .bind(new_version)
    .bind(config_hash)
    .bind(nodes_included)
    .bind(duration_ms)
    .bind(&now)
    .bind(&now)
    .bind(SINGLETON_ID)
    .execute(pool)
    .await
    .map_err(Error::db)?;
    Ok(())
}

/// Records a failed apply attempt: version/hash are left at their
/// previous values, `last_apply_success_at` is untouched, but the error,
/// duration and attempted node count are always recorded.
pub async fn record_failure(
    pool: &SqlitePool,
    error: &str,
    nodes_included: i64,
    duration_ms: i64,
) -> Result<(), Error> {
    ensure_row(pool).await?;
    let now = now_rfc3339();
    sqlx::query(
        "UPDATE runtime_state SET last_nodes_included = ?, last_apply_duration_ms = ?, \
         last_reload_at = ?, last_reload_error = ? WHERE id = ?",
    )
    .bind(nodes_included)
    .bind(duration_ms)
    .bind(&now)
    .bind(error)
    .bind(SINGLETON_ID)
    .execute(pool)
    .await
    .map_err(Error::db)?;
    Ok(())
}

async fn ensure_row(pool: &SqlitePool) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO runtime_state (id, config_version, config_hash, forwarding_running, \
         last_nodes_included) VALUES (?, 0, '', 0, 0) ON CONFLICT(id) DO NOTHING",
    )
    .bind(SINGLETON_ID)
    .execute(pool)
    .await
    .map_err(Error::db)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        let pool = crate::open("sqlite::memory:").await.unwrap();
        pool
    }

    #[tokio::test]
    async fn default_state_is_version_zero() {
        let pool = memory_pool().await;
        let state = load(&pool).await.unwrap();
        assert_eq!(state.config_version, 0);
        assert!(!state.forwarding_running);
    }

    #[tokio::test]
    async fn record_success_bumps_version_and_sets_success_timestamp() {
        let pool = memory_pool().await;
        record_success(&pool, 1, "abc123", 2, 42).await.unwrap();
        let state = load(&pool).await.unwrap();
        assert_eq!(state.config_version, 1);
        assert_eq!(state.config_hash, "abc123");
        assert_eq!(state.last_nodes_included, 2);
        assert!(state.last_apply_success_at.is_some());
        assert!(state.last_reload_error.is_none());
    }

    #[tokio::test]
    async fn record_failure_leaves_version_untouched() {
        let pool = memory_pool().await;
        record_success(&pool, 1, "abc123", 2, 42).await.unwrap();
        record_failure(&pool, "boom", 2, 10).await.unwrap();
        let state = load(&pool).await.unwrap();
        assert_eq!(state.config_version, 1);
        assert_eq!(state.config_hash, "abc123");
        assert_eq!(state.last_reload_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn set_forwarding_running_persists_flag() {
        let pool = memory_pool().await;
        set_forwarding_running(&pool, true).await.unwrap();
        let state = load(&pool).await.unwrap();
        assert!(state.forwarding_running);
    }
}
