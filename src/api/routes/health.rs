//! Health Routes
//!
//! Liveness and readiness probes.
//!
//! - GET /health/live - process is up
//! - GET /health/ready - gateway statistics for orchestration checks

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::api::state::AppState;

/// Response for the liveness probe
#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

/// Response for the readiness probe
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub connections: usize,
    pub operations: usize,
}

/// GET /health/live
pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// GET /health/ready
pub async fn readiness(State(state): State<Arc<AppState>>) -> Json<ReadinessResponse> {
    Json(ReadinessResponse {
        status: "ok",
        uptime_seconds: state.uptime_seconds(),
        connections: state.dispatcher.connection_count().await,
        operations: state.dispatcher.operation_count().await,
    })
}
