//! Error types for vigil-state.

use thiserror::Error;
use vigil_types::{DropletId, InstanceGuid};

/// Errors raised while applying events to droplet state.
#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    /// No instance is tracked at the given version and index.
    #[error("no instance of {droplet} at version {version} index {index}")]
    InstanceNotFound {
        droplet: DropletId,
        version: String,
        index: u32,
    },

    /// The event names a guid other than the one currently resident.
    #[error("guid mismatch for {droplet} index {index}: resident {resident:?}, event {received}")]
    GuidMismatch {
        droplet: DropletId,
        index: u32,
        resident: Option<InstanceGuid>,
        received: InstanceGuid,
    },

    /// A desired-state attribute required for this operation is absent.
    #[error("droplet {0} has no desired state")]
    MissingDesiredState(DropletId),
}

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;
