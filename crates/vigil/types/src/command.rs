//! Corrective commands published to the control plane.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{DropletId, InstanceGuid};
use crate::time::Timestamp;

/// Urgency of a queued command. Higher values drain first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Routine and crash restarts.
    Low,
    /// Missing-instance restarts.
    Normal,
    /// Restarts caused by an executor going away.
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Operation carried by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandOp {
    Start,
    Stop,
}

/// A start or stop request for instances of one droplet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCommand {
    Start {
        #[serde(rename = "droplet")]
        droplet_id: DropletId,
        version: String,
        last_updated: Timestamp,
        indices: Vec<u32>,
    },
    Stop {
        #[serde(rename = "droplet")]
        droplet_id: DropletId,
        last_updated: Timestamp,
        instances: Vec<InstanceGuid>,
    },
}

/// Command identity with `last_updated` removed.
///
/// Two commands with the same key are duplicates; the newer one supersedes
/// the older one in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandKey {
    Start {
        droplet_id: DropletId,
        version: String,
        indices: Vec<u32>,
    },
    Stop {
        droplet_id: DropletId,
        instances: Vec<InstanceGuid>,
    },
}

impl HealthCommand {
    pub fn start(
        droplet_id: DropletId,
        version: impl Into<String>,
        last_updated: Timestamp,
        mut indices: Vec<u32>,
    ) -> Self {
        indices.sort_unstable();
        indices.dedup();
        HealthCommand::Start {
            droplet_id,
            version: version.into(),
            last_updated,
            indices,
        }
    }

    pub fn stop(
        droplet_id: DropletId,
        last_updated: Timestamp,
        mut instances: Vec<InstanceGuid>,
    ) -> Self {
        instances.sort();
        instances.dedup();
        HealthCommand::Stop {
            droplet_id,
            last_updated,
            instances,
        }
    }

    pub fn op(&self) -> CommandOp {
        match self {
            HealthCommand::Start { .. } => CommandOp::Start,
            HealthCommand::Stop { .. } => CommandOp::Stop,
        }
    }

    pub fn droplet_id(&self) -> &DropletId {
        match self {
            HealthCommand::Start { droplet_id, .. } | HealthCommand::Stop { droplet_id, .. } => {
                droplet_id
            }
        }
    }

    pub fn dedup_key(&self) -> CommandKey {
        match self {
            HealthCommand::Start {
                droplet_id,
                version,
                indices,
                ..
            } => CommandKey::Start {
                droplet_id: droplet_id.clone(),
                version: version.clone(),
                indices: indices.clone(),
            },
            HealthCommand::Stop {
                droplet_id,
                instances,
                ..
            } => CommandKey::Stop {
                droplet_id: droplet_id.clone(),
                instances: instances.clone(),
            },
        }
    }
}
