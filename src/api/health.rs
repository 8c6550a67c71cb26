use super::websocket::WsAppState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub connections: usize,
    pub subscriptions: usize,
}

/// GET /health - live connection and subscription counts
pub async fn health_handler(State(state): State<Arc<WsAppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        connections: state.registry.connection_count(),
        subscriptions: state.registry.subscription_count(),
    })
}
