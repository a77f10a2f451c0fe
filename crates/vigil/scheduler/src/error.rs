//! Error types for vigil-scheduler.

use thiserror::Error;
use vigil_types::Timestamp;

/// Errors raised while scheduling tasks.
#[derive(Debug, Error, PartialEq)]
pub enum SchedulerError {
    /// Periodic tasks need a positive interval.
    #[error("periodic task interval must be positive")]
    ZeroInterval,

    /// The virtual clock only moves forward.
    #[error("virtual clock cannot move backwards from {now} to {requested}")]
    ClockRegression { now: Timestamp, requested: Timestamp },
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
