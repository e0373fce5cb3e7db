//! Route Definitions

use super::{
    handlers::{health_handler, metrics_handler, status_handler, AppState},
    websocket::websocket_handler,
};
use axum::{routing::get, Router};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>, enable_metrics: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        // Client sessions
        .route("/ws", get(websocket_handler));

    let router = if enable_metrics {
        router.route("/metrics", get(metrics_handler))
    } else {
        router
    };

    router.with_state(state)
}
