//! Error types for vigil-daemon

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use vigil_control::{BusError, ControlError};

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    /// Engine error
    #[error("Engine error: {0}")]
    Control(#[from] ControlError),

    /// HTTP client construction error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for DaemonError {
    fn from(err: config::ConfigError) -> Self {
        DaemonError::Config(err.to_string())
    }
}

/// API-specific errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Bus failure while injecting or requesting
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Bus(BusError::Codec(_)) => (StatusCode::BAD_REQUEST, "BAD_PAYLOAD"),
            ApiError::Bus(BusError::NoResponders(_)) => (StatusCode::NOT_FOUND, "NO_RESPONDERS"),
            ApiError::Bus(BusError::Timeout { .. }) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            ApiError::Bus(BusError::Closed) => (StatusCode::SERVICE_UNAVAILABLE, "BUS_CLOSED"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
