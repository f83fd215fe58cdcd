//! Axum middleware applied to the router: timeout enforcement and admin
//! authorisation.

use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::ErrorResponse;

use super::handlers::ApiError;
use super::state::AppState;

/// Default per-request timeout applied to all routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the caller's key on admin requests.
pub const FUNCTIONS_KEY_HEADER: &str = "x-functions-key";

/// Reject admin requests whose `x-functions-key` is not the host master key.
pub async fn require_master_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.auth_disabled {
        return next.run(request).await;
    }

    let Some(provided) = request
        .headers()
        .get(FUNCTIONS_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return unauthorized();
    };

    let host = match state.manager.get_host_secrets().await {
        Ok(host) => host,
        Err(e) => return ApiError(e).into_response(),
    };
    if !constant_time_eq(provided.as_bytes(), host.master_key.as_bytes()) {
        return unauthorized();
    }

    next.run(request).await
}

fn unauthorized() -> Response {
    let err = ErrorResponse::new("unauthorized", "a valid master key is required");
    (StatusCode::UNAUTHORIZED, Json(err)).into_response()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}
