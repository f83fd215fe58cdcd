//! Axum request handlers for the health and admin endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{
    ErrorResponse, HealthResponse, KeyOperationResult, KeyResponse, KeysResponse,
    OperationResult, SecretValueRequest, TokenResponse,
};
use common::secrets::DEFAULT_MASTER_KEY_NAME;
use common::SecretsError;
use serde::Deserialize;
use tracing::warn;

use super::state::AppState;
use crate::token::create_script_token;

/// A [`SecretsError`] rendered as an [`ErrorResponse`].
///
/// Server-side failures are logged and reported without detail.
#[derive(Debug)]
pub struct ApiError(pub SecretsError);

impl From<SecretsError> for ApiError {
    fn from(e: SecretsError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = if status.is_server_error() {
            warn!(error = %self.0, code = self.0.code(), "secret operation failed");
            "secret operation failed".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorResponse::new(self.0.code(), message))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct KeysQuery {
    #[serde(default)]
    pub merged: bool,
}

/// `GET /health`: liveness and readiness check.
///
/// Returns `200 OK` when host secrets can be resolved, `503 Service
/// Unavailable` otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let ready = match state.manager.get_host_secrets().await {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "host secrets unavailable");
            false
        }
    };

    let (status_code, status_str) = if ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = HealthResponse {
        status: status_str.into(),
        host_secrets_loaded: state.manager.has_cached_host_secrets(),
        cached_functions: state.manager.cached_function_count(),
    };
    (status_code, Json(body)).into_response()
}

/// `GET /admin/host/keys`: host-wide function keys.
pub async fn list_host_keys(State(state): State<AppState>) -> Result<Json<KeysResponse>, ApiError> {
    let host = state.manager.get_host_secrets().await?;
    Ok(Json(KeysResponse::from_map(&host.function_keys)))
}

/// `PUT /admin/host/keys/:name`: add or replace a host function key.
pub async fn put_host_key(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<SecretValueRequest>>,
) -> Result<Response, ApiError> {
    let value = requested_value(body);
    let result = state
        .manager
        .add_or_update_function_secret(&name, value.as_deref(), None)
        .await?;
    Ok(key_written(name, result))
}

/// `DELETE /admin/host/keys/:name`.
pub async fn delete_host_key(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let deleted = state.manager.delete_secret(&name, None).await?;
    Ok(key_deleted(deleted, &name))
}

/// `PUT /admin/host/masterkey`: replace the master key.
pub async fn put_master_key(
    State(state): State<AppState>,
    body: Option<Json<SecretValueRequest>>,
) -> Result<Response, ApiError> {
    let value = requested_value(body);
    let result = state.manager.set_master_key(value.as_deref()).await?;
    Ok(key_written(DEFAULT_MASTER_KEY_NAME.to_string(), result))
}

/// `GET /admin/functions/:name/keys?merged=bool`.
pub async fn list_function_keys(
    State(state): State<AppState>,
    Path(function): Path<String>,
    Query(query): Query<KeysQuery>,
) -> Result<Json<KeysResponse>, ApiError> {
    let keys = state
        .manager
        .get_function_secrets(&function, query.merged)
        .await?;
    Ok(Json(KeysResponse::from_map(&keys)))
}

/// `PUT /admin/functions/:name/keys/:key`: add or replace a function key.
pub async fn put_function_key(
    State(state): State<AppState>,
    Path((function, name)): Path<(String, String)>,
    body: Option<Json<SecretValueRequest>>,
) -> Result<Response, ApiError> {
    let value = requested_value(body);
    let result = state
        .manager
        .add_or_update_function_secret(&name, value.as_deref(), Some(&function))
        .await?;
    Ok(key_written(name, result))
}

/// `DELETE /admin/functions/:name/keys/:key`.
pub async fn delete_function_key(
    State(state): State<AppState>,
    Path((function, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let deleted = state.manager.delete_secret(&name, Some(&function)).await?;
    Ok(key_deleted(deleted, &name))
}

/// `POST /admin/token`: issue a short-lived script access token.
pub async fn issue_token(State(state): State<AppState>) -> Result<Response, ApiError> {
    let Some(key) = state.signing_key.as_deref() else {
        let err = ErrorResponse::new("service_unavailable", "no signing key is configured");
        return Ok((StatusCode::SERVICE_UNAVAILABLE, Json(err)).into_response());
    };
    let token = create_script_token(key)?;
    Ok(Json(TokenResponse { token }).into_response())
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

fn requested_value(body: Option<Json<SecretValueRequest>>) -> Option<String> {
    body.and_then(|Json(req)| req.value)
        .filter(|v| !v.trim().is_empty())
}

fn key_written(name: String, result: KeyOperationResult) -> Response {
    let status = match result.result {
        OperationResult::Created => StatusCode::CREATED,
        OperationResult::Updated => StatusCode::OK,
    };
    let body = KeyResponse {
        name,
        value: result.secret,
    };
    (status, Json(body)).into_response()
}

fn key_deleted(deleted: bool, name: &str) -> Response {
    if deleted {
        StatusCode::NO_CONTENT.into_response()
    } else {
        let err = ErrorResponse::new("not_found", format!("no key named {name}"));
        (StatusCode::NOT_FOUND, Json(err)).into_response()
    }
}
