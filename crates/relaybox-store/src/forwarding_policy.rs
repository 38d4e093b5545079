//! The singleton node-eligibility policy row.

use relaybox_core::{now_rfc3339, Error};
use relaybox_policy::ForwardingPolicy;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

const SINGLETON_ID: &str = "global";

/// Loads the forwarding policy, falling back to its documented defaults
/// (healthy-only disabled, untested nodes allowed) when no row exists yet.
pub async fn load(pool: &SqlitePool) -> Result<ForwardingPolicy, Error> {
    let row = sqlx::query("SELECT * FROM forwarding_policy WHERE id = ?")
        .bind(SINGLETON_ID)
        .fetch_optional(pool)
        .await
        .map_err(Error::db)?;
    let Some(row) = row else {
        return Ok(ForwardingPolicy::default());
    };
    let healthy_only_enabled: i64 = row.get("healthy_only_enabled");
    let allow_untested: i64 = row.get("allow_untested");
    Ok(ForwardingPolicy {
        healthy_only_enabled: healthy_only_enabled != 0,
        max_latency_ms: row.get("max_latency_ms"),
        allow_untested: allow_untested != 0,
    })
}

/// The probe-timing fields that live alongside the policy but aren't part
/// of the pure [`ForwardingPolicy`] the `relaybox-policy` crate filters on.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTiming {
    pub node_test_timeout_ms: i64,
    pub node_test_concurrency: i64,
}

/// Loads just the prober's timing/concurrency bounds.
pub async fn load_probe_timing(pool: &SqlitePool) -> Result<ProbeTiming, Error> {
    let row = sqlx::query("SELECT * FROM forwarding_policy WHERE id = ?")
        .bind(SINGLETON_ID)
        .fetch_optional(pool)
        .await
        .map_err(Error::db)?;
    Ok(match row {
        Some(row) => ProbeTiming {
            node_test_timeout_ms: row.get("node_test_timeout_ms"),
            node_test_concurrency: row.get("node_test_concurrency"),
        },
        None => ProbeTiming {
            node_test_timeout_ms: 3000,
            node_test_concurrency: 8,
        },
    })
}

/// Validates range invariants and persists the policy, including the
/// prober timing/concurrency fields stored alongside it.
#[allow(clippy::too_many_arguments)]
pub async fn save(
    pool: &SqlitePool,
    policy: &ForwardingPolicy,
    node_test_timeout_ms: i64,
    node_test_concurrency: i64,
) -> Result<(), Error> {
    if !(1..=10_000).contains(&policy.max_latency_ms) {
        return Err(Error::invalid_field(
            "max_latency_ms",
            policy.max_latency_ms.to_string(),
        ));
    }
    if !(500..=10_000).contains(&node_test_timeout_ms) {
        return Err(Error::invalid_field(
            "node_test_timeout_ms",
            node_test_timeout_ms.to_string(),
        ));
    }
    if !(1..=64).contains(&node_test_concurrency) {
        return Err(Error::invalid_field(
            "node_test_concurrency",
            node_test_concurrency.to_string(),
        ));
    }

    let now = now_rfc3339();
    sqlx::query(
        "INSERT INTO forwarding_policy (id, healthy_only_enabled, max_latency_ms, \
         allow_untested, node_test_timeout_ms, node_test_concurrency, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET healthy_only_enabled = excluded.healthy_only_enabled, \
         max_latency_ms = excluded.max_latency_ms, allow_untested = excluded.allow_untested, \
         node_test_timeout_ms = excluded.node_test_timeout_ms, \
         node_test_concurrency = excluded.node_test_concurrency, updated_at = excluded.updated_at",
    )
    .bind(SINGLETON_ID)
    .bind(i64::from(policy.healthy_only_enabled))
    .bind(policy.max_latency_ms)
    .bind(i64::from(policy.allow_untested))
    .bind(node_test_timeout_ms)
    .bind(node_test_concurrency)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(Error::db)?;
    Ok(())
}
