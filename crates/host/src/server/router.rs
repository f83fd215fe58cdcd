//! Axum router construction.

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, middleware, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
pub fn build(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/host/keys", get(handlers::list_host_keys))
        .route(
            "/admin/host/keys/:name",
            put(handlers::put_host_key).delete(handlers::delete_host_key),
        )
        .route("/admin/host/masterkey", put(handlers::put_master_key))
        .route("/admin/functions/:name/keys", get(handlers::list_function_keys))
        .route(
            "/admin/functions/:name/keys/:key",
            put(handlers::put_function_key).delete(handlers::delete_function_key),
        )
        .route("/admin/token", post(handlers::issue_token))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_master_key,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(admin)
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .with_state(state)
}
