use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

/// Room for a maximal source plus a maximal stdin, JSON-escaped.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::execute))
        .route("/sessions/:session_id/execute", post(handlers::execute_in_session))
        .route("/sessions/:session_id/execution", delete(handlers::cancel_session))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}
