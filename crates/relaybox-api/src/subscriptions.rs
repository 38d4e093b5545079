//! Subscription CRUD and the refresh-now action.

use crate::{ApiResult, AppState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use relaybox_store::subscriptions::SubscriptionRow;
use serde::Deserialize;

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/subscriptions", get(list).post(create))
        .route(
            "/api/subscriptions/{id}",
            get(get_one).patch(update).delete(delete),
        )
        .route("/api/subscriptions/{id}/refresh", post(refresh))
}

async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<SubscriptionRow>>> {
    let subs = relaybox_store::subscriptions::list(&state.pool, false).await?;
    Ok(Json(subs))
}

async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SubscriptionRow>> {
    let sub = relaybox_store::subscriptions::get(&state.pool, &id).await?;
    Ok(Json(sub))
}

#[derive(Debug, Deserialize)]
struct CreateSubscriptionRequest {
    name: String,
    url: String,
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default)]
    refresh_interval_sec: i64,
}

fn default_kind() -> String {
    "auto".to_string()
}

async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<SubscriptionRow>)> {
    if req.name.trim().is_empty() {
        return Err(relaybox_core::Error::missing_field("name").into());
    }
    if req.url.trim().is_empty() {
        return Err(relaybox_core::Error::missing_field("url").into());
    }
    let id = relaybox_store::subscriptions::create(
        &state.pool,
        &req.name,
        &req.url,
        &req.kind,
        req.refresh_interval_sec,
    )
    .await?;
    let sub = relaybox_store::subscriptions::get(&state.pool, id.as_str()).await?;
    Ok((StatusCode::CREATED, Json(sub)))
}

#[derive(Debug, Default, Deserialize)]
struct UpdateSubscriptionRequest {
    name: Option<String>,
    url: Option<String>,
    enabled: Option<bool>,
    auto_update_enabled: Option<bool>,
    refresh_interval_sec: Option<i64>,
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateSubscriptionRequest>,
) -> ApiResult<Json<SubscriptionRow>> {
    relaybox_store::subscriptions::get(&state.pool, &id).await?;
    relaybox_store::subscriptions::update(
        &state.pool,
        &id,
        req.name.as_deref(),
        req.url.as_deref(),
        req.enabled,
        req.auto_update_enabled,
        req.refresh_interval_sec,
    )
    .await?;
    let sub = relaybox_store::subscriptions::get(&state.pool, &id).await?;
    Ok(Json(sub))
}

async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    relaybox_store::subscriptions::get(&state.pool, &id).await?;
    relaybox_store::subscriptions::delete_cascade(&state.pool, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refresh(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<relaybox_refresher::RefreshOutcome>> {
    let outcome = relaybox_refresher::refresh(&state.pool, &id).await?;
    Ok(Json(outcome))
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
    async fn create_then_list_round_trips() {
        let state = test_state().await;
        let app = router(state.clone());
        let body = serde_json::json!({"name": "feed-a", "url": "https://example.com/a"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/subscriptions")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let subs = relaybox_store::subscriptions::list(&state.pool, false)
            .await
            .unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].name, "feed-a");
    }

    #[tokio::test]
    async fn create_rejects_blank_name() {
        let app = router(test_state().await);
        let body = serde_json::json!({"name": "", "url": "https://example.com/a"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/subscriptions")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_unknown_id_returns_404() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/subscriptions/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
