use std::str::FromStr;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use bandscore_core::SubmissionId;
use bandscore_infra::ServiceError;
use bandscore_infra::jobs::JobStoreError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("submission {id} not found")),
        ServiceError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        ServiceError::InvalidTransition(msg) => json_error(StatusCode::CONFLICT, "invalid_transition", msg),
        ServiceError::Store(JobStoreError::JobNotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        ServiceError::Store(JobStoreError::Conflict(msg)) => json_error(StatusCode::CONFLICT, "conflict", msg),
        ServiceError::Store(e) => {
            error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "internal storage error")
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_submission_id(raw: &str) -> Result<SubmissionId, axum::response::Response> {
    SubmissionId::from_str(raw).map_err(|_| {
        json_error(StatusCode::BAD_REQUEST, "invalid_id", "submission id must be a UUID")
    })
}
