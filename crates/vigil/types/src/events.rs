//! Anomaly events emitted by droplets and consumed by the policy engine.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{DropletId, InstanceGuid};
use crate::messages::{ExitMessage, ExitReason};

/// Why a running instance should be stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraReason {
    /// The droplet's desired state is STOPPED.
    DropletStopped,
    /// Duplicate at an index, or an index beyond the desired count.
    ExtraInstance,
    /// The instance runs a version other than the live one.
    NotLiveVersion,
}

impl fmt::Display for ExtraReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtraReason::DropletStopped => write!(f, "Droplet stopped"),
            ExtraReason::ExtraInstance => write!(f, "Extra instance"),
            ExtraReason::NotLiveVersion => write!(f, "Not live version"),
        }
    }
}

/// Discriminant of [`AnomalyEvent`], used as the key of policy bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    MissingInstances,
    ExtraInstances,
    ExitDea,
    ExitCrashed,
    DropletUpdated,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 5] = [
        AnomalyKind::MissingInstances,
        AnomalyKind::ExtraInstances,
        AnomalyKind::ExitDea,
        AnomalyKind::ExitCrashed,
        AnomalyKind::DropletUpdated,
    ];
}

/// Something a droplet noticed that may need a corrective action.
#[derive(Debug, Clone, PartialEq)]
pub enum AnomalyEvent {
    /// Desired indices with no confirming heartbeat and no restart in flight.
    MissingInstances {
        droplet_id: DropletId,
        indices: Vec<u32>,
    },

    /// Running instances that should not exist.
    ExtraInstances {
        droplet_id: DropletId,
        instances: BTreeMap<InstanceGuid, ExtraReason>,
    },

    /// An instance disappeared because its executor shut down or evacuated.
    ExitDea {
        droplet_id: DropletId,
        version: String,
        index: u32,
        reason: ExitReason,
    },

    /// An instance crashed.
    ExitCrashed {
        droplet_id: DropletId,
        message: ExitMessage,
    },

    /// The droplet was redeployed or restarted externally.
    DropletUpdated { droplet_id: DropletId },
}

impl AnomalyEvent {
    pub fn kind(&self) -> AnomalyKind {
        match self {
            AnomalyEvent::MissingInstances { .. } => AnomalyKind::MissingInstances,
            AnomalyEvent::ExtraInstances { .. } => AnomalyKind::ExtraInstances,
            AnomalyEvent::ExitDea { .. } => AnomalyKind::ExitDea,
            AnomalyEvent::ExitCrashed { .. } => AnomalyKind::ExitCrashed,
            AnomalyEvent::DropletUpdated { .. } => AnomalyKind::DropletUpdated,
        }
    }

    pub fn droplet_id(&self) -> &DropletId {
        match self {
            AnomalyEvent::MissingInstances { droplet_id, .. }
            | AnomalyEvent::ExtraInstances { droplet_id, .. }
            | AnomalyEvent::ExitDea { droplet_id, .. }
            | AnomalyEvent::ExitCrashed { droplet_id, .. }
            | AnomalyEvent::DropletUpdated { droplet_id } => droplet_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_reason_strings() {
        assert_eq!(ExtraReason::ExtraInstance.to_string(), "Extra instance");
        assert_eq!(ExtraReason::DropletStopped.to_string(), "Droplet stopped");
        assert_eq!(ExtraReason::NotLiveVersion.to_string(), "Not live version");
    }

    #[test]
    fn test_event_kind() {
        let event = AnomalyEvent::DropletUpdated {
            droplet_id: DropletId::new("app"),
        };
        assert_eq!(event.kind(), AnomalyKind::DropletUpdated);
        assert_eq!(event.droplet_id().as_str(), "app");
    }
}
