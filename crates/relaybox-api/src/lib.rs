//! External HTTP surface: a thin `axum` router binding requests to the
//! store, the refresher, the prober and the apply pipeline. DTO shapes
//! here are the minimum needed to exercise the system end to end, not a
//! specified wire contract.

mod nodes;
mod runtime;
mod settings;
mod subscriptions;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use relaybox_apply::{ApplyOptions, ApplyPipeline};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Upper bound on how long a single reload (including any check/restart
/// subprocess) is allowed to run before its cancellation token fires.
const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared handler state. Cheap to clone: the pool is itself a connection
/// pool handle, the pipeline is reference-counted, and `apply_options` is
/// a handful of owned strings fixed at startup.
#[derive(Clone)]
pub struct AppState {
    pool: SqlitePool,
    pipeline: Arc<ApplyPipeline>,
    apply_options: ApplyOptions,
}

impl AppState {
    #[must_use]
    pub fn new(pool: SqlitePool, pipeline: Arc<ApplyPipeline>, apply_options: ApplyOptions) -> Self {
        Self { pool, pipeline, apply_options }
    }

    /// Runs one reload through the shared pipeline, bounding it with a
    /// request-scoped cancellation timeout so a wedged check/restart
    /// command can't hold the critical section open forever.
    async fn reload(&self) -> Result<relaybox_apply::ApplyOutcome, relaybox_core::Error> {
        let cancel = CancellationToken::new();
        let timeout_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RELOAD_TIMEOUT).await;
            timeout_cancel.cancel();
        });
        self.pipeline.reload(&self.pool, &self.apply_options, cancel).await
    }
}

/// Builds the full router: health check plus every resource's routes,
/// layered with permissive CORS and request tracing.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .merge(subscriptions::routes())
        .merge(nodes::routes())
        .merge(settings::routes())
        .merge(runtime::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Wraps the shared error taxonomy so it can implement `IntoResponse`
/// without running into the orphan rule (`Error` and `IntoResponse` are
/// both foreign to this crate).
pub(crate) struct ApiError(relaybox_core::Error);

impl From<relaybox_core::Error> for ApiError {
    fn from(err: relaybox_core::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        let body = Json(serde_json::json!({
            "error": {
                "code": self.0.code,
                "message": self.0.message,
                "details": self.0.details,
            }
        }));
        (status, body).into_response()
    }
}

/// Shorthand used by every handler module.
pub(crate) type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(relaybox_core::Error::new("REQ_BAD_REQUEST", message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use relaybox_apply::ApplyOptions;
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
    async fn healthz_returns_ok() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_subscription_returns_404() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/subscriptions/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
