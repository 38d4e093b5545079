//! SQLite persistence for every relaybox entity: subscriptions, nodes,
//! inbound/routing/policy settings and runtime state. One plain
//! `async fn(&SqlitePool, ...)` per operation, grouped by entity module.

pub mod forwarding_policy;
pub mod node_proxy_overrides;
pub mod nodes;
pub mod proxy_settings;
pub mod routing_settings;
pub mod runtime_state;
pub mod subscriptions;

use relaybox_core::Error;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Opens (creating if needed) the SQLite database at `url` and runs any
/// pending embedded migrations.
pub async fn open(url: &str) -> Result<SqlitePool, Error> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(Error::db)?
        .create_if_missing(true);
    // A bare `:memory:` URL gives each pooled connection its own isolated
    // database; cap the pool at one connection so every caller shares it.
    let max_connections = if url.contains(":memory:") { 1 } else { 8 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(Error::db)?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Runs the embedded migration set against an already-open pool.
pub async fn migrate(pool: &SqlitePool) -> Result<(), Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::new("DB_MIGRATION_FAILED", e.to_string()))
}

/// True if a `sqlx::Error` looks like "no such column" — SQLite's way of
/// saying a legacy database predates a column this call wants to touch.
/// Used by [`subscriptions::record_usage_metadata`] to swallow exactly
/// that failure mode while still propagating everything else.
pub fn is_missing_column_error(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|e| e.message().contains("no such column"))
        .unwrap_or(false)
}
