//! Request Handlers

use super::{
    errors::ApiError,
    middleware::RequestId,
    models::*,
    websocket::SessionManager,
};
use crate::{engine::Engine, rounds::seconds_until_boundary};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub engine: Arc<Engine>,
    pub sessions: SessionManager,
    pub version: String,
}

/// Health check handler
/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
    })
}

/// Slot, queue and link overview
/// GET /status
pub async fn status_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let engine = &state.engine;

    let queue_length = engine
        .store
        .count_queued()
        .await
        .map_err(|e| ApiError::from_arcade(request_id.0.clone(), &e))?;
    let round = engine
        .store
        .current_round()
        .await
        .map_err(|e| ApiError::from_arcade(request_id.0.clone(), &e))?;

    let view = engine.state.view();
    let health = engine.hardware.health();

    Ok(Json(StatusResponse {
        current_player: view.current_player,
        current_entry_id: view.current_entry_id,
        turn_elapsed_secs: view.turn_started_at.map(|t| t.elapsed().as_secs()),
        queue_length,
        round_id: round.map(|r| r.id),
        round_changing: engine.state.is_round_changing(),
        seconds_to_round_end: seconds_until_boundary(Utc::now(), engine.config.round_boundary_hour_utc),
        link: LinkInfo {
            transport_connected: health.transport_connected(),
            namespace_ready: health.namespace_ready(),
            healthy: health.is_healthy(),
        },
        totals: engine.state.totals(),
        connected_clients: state.sessions.client_count(),
    }))
}

/// Prometheus exposition
/// GET /metrics
pub async fn metrics_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let body = state
        .engine
        .metrics
        .render()
        .map_err(|e| ApiError::internal_error(request_id.0, format!("Failed to render metrics: {}", e)))?;

    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body))
}
