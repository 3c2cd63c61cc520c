use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{sse::Event as SseEvent, IntoResponse},
    Json,
};

use crate::app::errors;
use crate::app::services::{self, AppServices};
use crate::context::UserContext;

/// Liveness plus queue and embedded-worker counters.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.submissions().job_stats().await {
        Ok(jobs) => Json(serde_json::json!({
            "status": "ok",
            "jobs": jobs,
            "workers": services.worker_stats(),
        }))
        .into_response(),
        Err(e) => errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string()),
    }
}

pub async fn whoami(Extension(user): Extension<UserContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "user_id": user.user_id().to_string(),
    }))
}

pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    services::user_sse_stream(services, user.user_id())
}
