//! Error types for the control layer

use std::time::Duration;

use thiserror::Error;
use vigil_scheduler::SchedulerError;
use vigil_state::StateError;
use vigil_types::ValidationError;

/// Message bus failures.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus has been shut down
    #[error("Bus closed")]
    Closed,

    /// No reply arrived in time
    #[error("Request on {topic} timed out after {after:?}")]
    Timeout { topic: String, after: Duration },

    /// Nobody is subscribed to the request subject
    #[error("No responders on {0}")]
    NoResponders(String),

    /// Payload could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Desired-state provider failures. All of them are retried on the next refresh.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport-level failure talking to the source
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// The source answered with something unreadable
    #[error("Decode failed: {0}")]
    Decode(String),

    /// The source rejected our credentials
    #[error("Unauthorized")]
    Unauthorized,

    /// The source is switched off or unreachable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Credential acquisition over the bus failed
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// The fetch task panicked or was cancelled before reporting
    #[error("Fetch interrupted")]
    Interrupted,
}

/// Control layer error type
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// An inbound payload failed validation
    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The engine is already running or its channels were taken
    #[error("Engine already started")]
    AlreadyStarted,
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Result type for control operations
pub type ControlResult<T> = Result<T, ControlError>;
