use std::str::FromStr;

use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use bandscore_core::UserId;

use crate::app::errors::json_error;
use crate::context::UserContext;

/// Header carrying the caller's user id. Authentication happens upstream.
pub const USER_ID_HEADER: &str = "x-user-id";

pub async fn user_context_middleware(mut req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let user_id = match extract_user_id(req.headers()) {
        Ok(id) => id,
        Err(message) => return json_error(StatusCode::UNAUTHORIZED, "unauthenticated", message),
    };

    req.extensions_mut().insert(UserContext::new(user_id));
    next.run(req).await
}

fn extract_user_id(headers: &HeaderMap) -> Result<UserId, &'static str> {
    let header = headers
        .get(USER_ID_HEADER)
        .ok_or("missing x-user-id header")?;

    let raw = header.to_str().map_err(|_| "x-user-id header is not valid text")?;
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("missing x-user-id header");
    }

    UserId::from_str(raw).map_err(|_| "x-user-id must be a UUID")
}
