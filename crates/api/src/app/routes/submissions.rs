use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};

use bandscore_infra::SubmitOutcome;

use crate::app::dto;
use crate::app::errors::{self, parse_submission_id};
use crate::app::services::AppServices;
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_submission).get(list_submissions))
        .route("/:id/draft", put(revise_draft))
        .route("/:id/submit", post(submit_for_evaluation))
        .route("/:id/status", get(get_status))
        .route("/:id/retry", post(retry_failed))
}

pub async fn create_submission(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::CreateSubmissionRequest>,
) -> axum::response::Response {
    match services
        .submissions()
        .create_submission(user.user_id(), body.task.into_task(), &body.essay_text)
        .await
    {
        Ok(submission) => (
            StatusCode::CREATED,
            Json(dto::SubmissionResponse::from(&submission)),
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn revise_draft(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ReviseDraftRequest>,
) -> axum::response::Response {
    let id = match parse_submission_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services
        .submissions()
        .revise_draft(user.user_id(), id, &body.essay_text)
        .await
    {
        Ok(submission) => Json(dto::SubmissionResponse::from(&submission)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// 201 when a new evaluation was queued, 200 when an existing one is returned.
pub async fn submit_for_evaluation(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_submission_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    let outcome = match services.submissions().submit_for_evaluation(user.user_id(), id).await {
        Ok(o) => o,
        Err(e) => return errors::service_error_to_response(e),
    };

    let status = if outcome.is_new() { StatusCode::CREATED } else { StatusCode::OK };
    let label = match &outcome {
        SubmitOutcome::Queued(_) => "queued",
        SubmitOutcome::AlreadyQueued(_) => "already_queued",
        SubmitOutcome::Duplicate(_) => "duplicate",
    };

    (
        status,
        Json(dto::SubmitResponse {
            submission: dto::SubmissionResponse::from(outcome.submission()),
            outcome: label,
        }),
    )
        .into_response()
}

pub async fn get_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_submission_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.submissions().get_status(user.user_id(), id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn retry_failed(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_submission_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.submissions().retry_failed(user.user_id(), id).await {
        Ok(submission) => Json(dto::SubmissionResponse::from(&submission)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_submissions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<dto::PageQuery>,
) -> axum::response::Response {
    let page = query.page.unwrap_or(1);
    match services.submissions().list_submissions(user.user_id(), page).await {
        Ok(page) => Json(dto::HistoryResponse::from(page)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
