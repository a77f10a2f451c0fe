//! Health and status handlers

use axum::{extract::State, Json};
use serde::Serialize;
use vigil_control::EngineSnapshot;

use crate::api::rest::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    /// `healthy`, or `degraded` while desired state is unavailable
    pub status: String,
    pub version: String,
    pub uptime: String,
}

/// Health check endpoint. Keeps answering while the engine is degraded.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthCheckResponse> {
    let status = if state.snapshot().desired_state_available {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthCheckResponse {
        status: status.to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
    })
}

/// Daemon status response
#[derive(Debug, Serialize)]
pub struct DaemonStatusResponse {
    pub version: String,
    pub uptime: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub engine: EngineSnapshot,
}

/// Daemon status endpoint
pub async fn daemon_status(State(state): State<AppState>) -> Json<DaemonStatusResponse> {
    Json(DaemonStatusResponse {
        version: state.version.clone(),
        uptime: state.uptime(),
        started_at: state.started_at,
        engine: state.snapshot(),
    })
}
