//! Payload validation errors.

use thiserror::Error;

/// Reasons an inbound payload is dropped before it reaches the engine.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Payload is not valid JSON or does not match the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A required field is present but empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A field holds a value outside its domain.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Result type for payload validation.
pub type ValidationResult<T> = Result<T, ValidationError>;
