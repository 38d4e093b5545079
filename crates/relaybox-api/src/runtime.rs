//! Runtime state inspection and the two mutating runtime actions:
//! toggling operator forwarding intent and triggering a reload.

use crate::{ApiResult, AppState};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use relaybox_apply::ApplyOutcome;
use relaybox_store::runtime_state::RuntimeStateRow;
use serde::{Deserialize, Serialize};

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/runtime", get(get_state))
        .route("/api/runtime/forwarding", post(set_forwarding))
        .route("/api/runtime/reload", post(reload))
}

async fn get_state(State(state): State<AppState>) -> ApiResult<Json<RuntimeStateRow>> {
    let row = relaybox_store::runtime_state::load(&state.pool).await?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
struct SetForwardingRequest {
    running: bool,
}

/// Wire shape for a completed reload; `restart_output` is rendered
/// lossily as text since the API boundary has no use for raw bytes.
#[derive(Debug, Serialize)]
struct ReloadResponse {
    version: i64,
    hash: String,
    restart_output: String,
}

impl From<ApplyOutcome> for ReloadResponse {
    fn from(outcome: ApplyOutcome) -> Self {
        Self {
            version: outcome.version,
            hash: outcome.hash,
            restart_output: String::from_utf8_lossy(&outcome.restart_output).into_owned(),
        }
    }
}

/// Flips the operator-intent flag, then immediately reloads so the
/// engine's inbound exposure matches it. This compound operation is the
/// other globally-serialised critical section alongside a plain reload,
/// since the reload it triggers goes through the same pipeline lock.
async fn set_forwarding(
    State(state): State<AppState>,
    Json(req): Json<SetForwardingRequest>,
) -> ApiResult<Json<ReloadResponse>> {
    relaybox_store::runtime_state::set_forwarding_running(&state.pool, req.running).await?;
    let outcome = state.reload().await?;
    Ok(Json(outcome.into()))
}

async fn reload(State(state): State<AppState>) -> ApiResult<Json<ReloadResponse>> {
    let outcome = state.reload().await?;
    Ok(Json(outcome.into()))
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
    async fn get_runtime_state_starts_at_version_zero() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/api/runtime").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let row: RuntimeStateRow = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(row.config_version, 0);
    }

    #[tokio::test]
    async fn reload_without_restart_cmd_fails_with_missing_field() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/runtime/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
