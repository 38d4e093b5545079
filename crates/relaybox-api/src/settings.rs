//! Global settings resources: proxy inbounds, routing bypass rules and
//! the forwarding policy.

use crate::{ApiResult, AppState};
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use relaybox_policy::ForwardingPolicy;
use relaybox_store::proxy_settings::ProxySettingsRow;
use relaybox_synth::RoutingSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/settings/proxy", get(list_proxy))
        .route("/api/settings/proxy/{proxy_type}", get(get_proxy).put(put_proxy))
        .route("/api/settings/routing", get(get_routing).put(put_routing))
        .route("/api/settings/policy", get(get_policy).put(put_policy))
}

async fn list_proxy(
    State(state): State<AppState>,
) -> ApiResult<Json<HashMap<String, ProxySettingsRow>>> {
    let settings = relaybox_store::proxy_settings::get_all(&state.pool).await?;
    Ok(Json(settings))
}

async fn get_proxy(
    State(state): State<AppState>,
    Path(proxy_type): Path<String>,
) -> ApiResult<Json<ProxySettingsRow>> {
    let row = relaybox_store::proxy_settings::get(&state.pool, &proxy_type).await?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
struct PutProxyRequest {
    enabled: bool,
    listen_address: String,
    port: i64,
    #[serde(default = "default_auth_mode")]
    auth_mode: String,
    username: Option<String>,
    password: Option<String>,
}

fn default_auth_mode() -> String {
    "none".to_string()
}

async fn put_proxy(
    State(state): State<AppState>,
    Path(proxy_type): Path<String>,
    Json(req): Json<PutProxyRequest>,
) -> ApiResult<Json<ProxySettingsRow>> {
    relaybox_store::proxy_settings::upsert(
        &state.pool,
        &proxy_type,
        req.enabled,
        &req.listen_address,
        req.port,
        &req.auth_mode,
        req.username.as_deref(),
        req.password.as_deref(),
    )
    .await?;
    let row = relaybox_store::proxy_settings::get(&state.pool, &proxy_type).await?;
    Ok(Json(row))
}

async fn get_routing(State(state): State<AppState>) -> ApiResult<Json<RoutingSettings>> {
    let settings = relaybox_store::routing_settings::load(&state.pool).await?;
    Ok(Json(settings))
}

async fn put_routing(
    State(state): State<AppState>,
    Json(req): Json<RoutingSettings>,
) -> ApiResult<Json<RoutingSettings>> {
    relaybox_store::routing_settings::save(&state.pool, &req).await?;
    let settings = relaybox_store::routing_settings::load(&state.pool).await?;
    Ok(Json(settings))
}

/// The forwarding policy plus the prober timing/concurrency bounds that
/// are persisted alongside it, flattened into one wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicyView {
    #[serde(flatten)]
    policy: ForwardingPolicy,
    node_test_timeout_ms: i64,
    node_test_concurrency: i64,
}

async fn get_policy(State(state): State<AppState>) -> ApiResult<Json<PolicyView>> {
    let policy = relaybox_store::forwarding_policy::load(&state.pool).await?;
    let timing = relaybox_store::forwarding_policy::load_probe_timing(&state.pool).await?;
    Ok(Json(PolicyView {
        policy,
        node_test_timeout_ms: timing.node_test_timeout_ms,
        node_test_concurrency: timing.node_test_concurrency,
    }))
}

async fn put_policy(
    State(state): State<AppState>,
    Json(req): Json<PolicyView>,
) -> ApiResult<Json<PolicyView>> {
    relaybox_store::forwarding_policy::save(
        &state.pool,
        &req.policy,
        req.node_test_timeout_ms,
        req.node_test_concurrency,
    )
    .await?;
    get_policy(State(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
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
    async fn get_routing_returns_defaults() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/api/settings/routing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn put_proxy_rejects_invalid_port() {
        let app = router(test_state().await);
        let body = serde_json::json!({
            "enabled": true,
            "listen_address": "0.0.0.0",
            "port": 0,
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/settings/proxy/http")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
