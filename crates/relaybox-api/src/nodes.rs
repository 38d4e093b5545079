//! Node listing/flag updates, per-node inbound overrides, and the
//! on-demand probe action.

use crate::{bad_request, ApiResult, AppState};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use relaybox_prober::ProbeMode;
use relaybox_store::node_proxy_overrides::NodeProxyOverrideRow;
use relaybox_store::nodes::NodeRow;
use serde::Deserialize;

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/nodes", get(list))
        .route("/api/nodes/{id}", get(get_one).patch(update))
        .route("/api/nodes/probe", post(probe))
        .route(
            "/api/nodes/{id}/overrides/{proxy_type}",
            get(get_override).put(put_override).delete(delete_override),
        )
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    sub_id: Option<String>,
    enabled: Option<bool>,
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<NodeRow>>> {
    let nodes = match query.sub_id {
        Some(sub_id) => relaybox_store::nodes::list(&state.pool, &sub_id, query.enabled).await?,
        None => relaybox_store::nodes::list_all(&state.pool).await?,
    };
    Ok(Json(nodes))
}

async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<NodeRow>> {
    let node = relaybox_store::nodes::get(&state.pool, &id).await?;
    Ok(Json(node))
}

#[derive(Debug, Default, Deserialize)]
struct UpdateNodeRequest {
    enabled: Option<bool>,
    forwarding_enabled: Option<bool>,
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateNodeRequest>,
) -> ApiResult<Json<NodeRow>> {
    relaybox_store::nodes::get(&state.pool, &id).await?;
    relaybox_store::nodes::update_flags(&state.pool, &id, req.enabled, req.forwarding_enabled)
        .await?;
    let node = relaybox_store::nodes::get(&state.pool, &id).await?;
    Ok(Json(node))
}

#[derive(Debug, Deserialize)]
struct ProbeRequest {
    node_ids: Vec<String>,
    #[serde(default = "default_mode")]
    mode: ProbeMode,
}

fn default_mode() -> ProbeMode {
    ProbeMode::Ping
}

async fn probe(
    State(state): State<AppState>,
    Json(req): Json<ProbeRequest>,
) -> ApiResult<Json<Vec<relaybox_prober::ProbeResult>>> {
    if req.node_ids.is_empty() {
        return Err(bad_request("node_ids must not be empty"));
    }
    let timing = relaybox_store::forwarding_policy::load_probe_timing(&state.pool).await?;
    let results = relaybox_prober::probe_nodes(
        &state.pool,
        &req.node_ids,
        req.mode,
        timing.node_test_timeout_ms,
        timing.node_test_concurrency,
    )
    .await?;
    Ok(Json(results))
}

async fn get_override(
    State(state): State<AppState>,
    Path((node_id, proxy_type)): Path<(String, String)>,
) -> ApiResult<Json<Option<NodeProxyOverrideRow>>> {
    relaybox_store::nodes::get(&state.pool, &node_id).await?;
    let mut overrides = relaybox_store::node_proxy_overrides::get_for_node(&state.pool, &node_id).await?;
    Ok(Json(overrides.remove(&proxy_type)))
}

#[derive(Debug, Deserialize)]
struct PutOverrideRequest {
    enabled: bool,
    listen_address: Option<String>,
    port: Option<i64>,
    #[serde(default = "default_auth_mode")]
    auth_mode: String,
    username: Option<String>,
    password: Option<String>,
}

fn default_auth_mode() -> String {
    "none".to_string()
}

async fn put_override(
    State(state): State<AppState>,
    Path((node_id, proxy_type)): Path<(String, String)>,
    Json(req): Json<PutOverrideRequest>,
) -> ApiResult<Json<NodeProxyOverrideRow>> {
    relaybox_store::nodes::get(&state.pool, &node_id).await?;
    relaybox_store::node_proxy_overrides::upsert(
        &state.pool,
        &node_id,
        &proxy_type,
        req.enabled,
        req.listen_address.as_deref(),
        req.port,
        &req.auth_mode,
        req.username.as_deref(),
        req.password.as_deref(),
    )
    .await?;
    let mut overrides = relaybox_store::node_proxy_overrides::get_for_node(&state.pool, &node_id).await?;
    overrides
        .remove(&proxy_type)
        .ok_or_else(|| bad_request("override not persisted"))
        .map(Json)
}

async fn delete_override(
    State(state): State<AppState>,
    Path((node_id, proxy_type)): Path<(String, String)>,
) -> ApiResult<axum::http::StatusCode> {
    relaybox_store::node_proxy_overrides::delete(&state.pool, &node_id, &proxy_type).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use axum::body::Body;
    use axum::http::Request;
    use relaybox_apply::{ApplyOptions, ApplyPipeline};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let pool = relaybox_store::open("sqlite::memory:").await.unwrap();
        let pipeline = Arc::new(ApplyPipeline::new());
        let opts = ApplyOptions {
            config_path: std::path::PathBuf::from("/tmp/does-not-matter.json"),
            check_cmd: None,
            restart_cmd: None,
            external_controller: None,
        };
        AppState::new(pool, pipeline, opts)
    }

    #[tokio::test]
    async fn list_nodes_starts_empty() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/api/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let nodes: Vec<NodeRow> = serde_json::from_slice(&bytes).unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn probe_rejects_empty_node_ids() {
        let app = router(test_state().await);
        let body = serde_json::json!({"node_ids": []});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/nodes/probe")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_unknown_node_returns_404() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/nodes/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }
}
