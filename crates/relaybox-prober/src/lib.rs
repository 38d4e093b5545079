//! Bounded-concurrency node health prober. Network probes (`ping` or
//! `http`) run across a worker pool in parallel; result writes back to the
//! store happen strictly sequentially from the dispatching task, so a
//! probe batch never contends with a concurrent subscription refresh
//! transaction.

use relaybox_core::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Which network operation the prober performs against each node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Open a bare TCP connection to `server:port`.
    Ping,
    /// Issue an HTTP(S) HEAD to `server:port/`.
    Http,
}

/// The outcome of probing one node, already shaped for
/// [`relaybox_store::nodes::set_probe_result`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub node_id: String,
    pub status: String,
    pub latency_ms: Option<i64>,
    pub error: Option<String>,
}

/// Probes `node_ids` using `mode`, bounded by `timeout_ms` per node and a
/// worker pool of `min(concurrency, node_ids.len())` (floor 1). Returns one
/// result per input id, in no particular order. Nodes that fail to load
/// (deleted mid-batch, malformed outbound JSON) produce a synthesised
/// error result rather than aborting the batch.
pub async fn probe_nodes(
    pool: &SqlitePool,
    node_ids: &[String],
    mode: ProbeMode,
    timeout_ms: i64,
    concurrency: i64,
) -> Result<Vec<ProbeResult>, Error> {
    if node_ids.is_empty() {
        return Ok(Vec::new());
    }

    let worker_count = concurrency.max(1).min(node_ids.len() as i64) as usize;
    let timeout = Duration::from_millis(timeout_ms.max(0) as u64);

    let (task_tx, task_rx) = mpsc::channel::<String>(node_ids.len());
    let (result_tx, mut result_rx) = mpsc::channel::<ProbeResult>(node_ids.len());
    let task_rx = Arc::new(Mutex::new(task_rx));

    for worker_id in 0..worker_count {
        let task_rx = Arc::clone(&task_rx);
        let result_tx = result_tx.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            loop {
                let node_id = {
                    let mut rx = task_rx.lock().await;
                    rx.recv().await
                };
                let Some(node_id) = node_id else {
                    break;
                };
                debug!(worker_id, %node_id, "probing node");
                let result = probe_one(&pool, &node_id, mode, timeout).await;
                if result_tx.send(result).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    for id in node_ids {
        if task_tx.send(id.clone()).await.is_err() {
            break;
        }
    }
    drop(task_tx);

    let mut results = Vec::with_capacity(node_ids.len());
    while let Some(result) = result_rx.recv().await {
        relaybox_store::nodes::set_probe_result(
            pool,
            &result.node_id,
            &result.status,
            result.latency_ms,
            result.error.as_deref(),
        )
        .await?;
        results.push(result);
    }
    Ok(results)
}

async fn probe_one(
    pool: &SqlitePool,
    node_id: &str,
    mode: ProbeMode,
    timeout: Duration,
) -> ProbeResult {
    let node = match relaybox_store::nodes::get(pool, node_id).await {
        Ok(node) => node,
        Err(e) => {
            return ProbeResult {
                node_id: node_id.to_string(),
                status: "error".to_string(),
                latency_ms: None,
                error: Some(e.message),
            }
        }
    };

    let Some((server, port, tls)) = endpoint_from_outbound(&node.outbound_json) else {
        return ProbeResult {
            node_id: node_id.to_string(),
            status: "error".to_string(),
            latency_ms: None,
            error: Some("outbound missing server/server_port".to_string()),
        };
    };

    let started = Instant::now();
    let outcome = match mode {
        ProbeMode::Ping => probe_tcp(&server, port, timeout).await,
        ProbeMode::Http => probe_http(&server, port, tls, timeout).await,
    };

    match outcome {
        Ok(()) => ProbeResult {
            node_id: node_id.to_string(),
            status: "ok".to_string(),
            latency_ms: Some(started.elapsed().as_millis() as i64),
            error: None,
        },
        Err(message) => {
            warn!(%node_id, %message, "probe failed");
            ProbeResult {
                node_id: node_id.to_string(),
                status: "error".to_string(),
                latency_ms: None,
                error: Some(message),
            }
        }
    }
}

async fn probe_tcp(server: &str, port: u16, timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(timeout, TcpStream::connect((server, port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("dial timed out".to_string()),
    }
}

async fn probe_http(server: &str, port: u16, tls: bool, timeout: Duration) -> Result<(), String> {
    let scheme = if tls { "https" } else { "http" };
    let url = format!("{scheme}://{server}:{port}/");
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| e.to_string())?;
    client.head(&url).send().await.map(|_| ()).map_err(|e| e.to_string())
}

/// Pulls `(server, server_port, tls.enabled)` out of a raw outbound JSON
/// blob. `server_port` is accepted as either a JSON number or string.
fn endpoint_from_outbound(raw: &str) -> Option<(String, u16, bool)> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let server = value.get("server")?.as_str()?.to_string();
    let port = value.get("server_port").and_then(|v| {
        v.as_u64()
            .map(|n| n as u16)
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })?;
    let tls = value
        .get("tls")
        .and_then(|t| t.get("enabled"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Some((server, port, tls))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_server_and_port() {
        let raw = r#"{"type":"vmess","server":"1.2.3.4","server_port":443}"#;
        let (server, port, tls) = endpoint_from_outbound(raw).unwrap();
        assert_eq!(server, "1.2.3.4");
        assert_eq!(port, 443);
        assert!(!tls);
    }

    #[test]
    fn detects_tls_enabled() {
        let raw = r#"{"server":"x","server_port":443,"tls":{"enabled":true}}"#;
        let (_, _, tls) = endpoint_from_outbound(raw).unwrap();
        assert!(tls);
    }

    #[test]
    fn missing_server_yields_none() {
        assert!(endpoint_from_outbound(r#"{"server_port":443}"#).is_none());
    }

    #[tokio::test]
    async fn empty_batch_returns_empty() {
        let pool = relaybox_store::open("sqlite::memory:").await.unwrap();
        let results = probe_nodes(&pool, &[], ProbeMode::Ping, 500, 4).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn unknown_node_id_produces_error_result_not_abort() {
        let pool = relaybox_store::open("sqlite::memory:").await.unwrap();
        let ids = vec!["missing-node".to_string()];
        let results = probe_nodes(&pool, &ids, ProbeMode::Ping, 500, 4)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "error");
    }
}
