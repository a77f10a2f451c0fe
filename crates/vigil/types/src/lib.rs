//! # Vigil Types - Core types for fleet health reconciliation
//!
//! Shared vocabulary for every Vigil crate:
//!
//! - [`ids`]: droplet, instance and executor identifiers
//! - [`time`]: logical [`Timestamp`] in seconds
//! - [`messages`]: inbound heartbeat, exit, update and advance-time payloads
//! - [`desired`]: desired state fetched from the control-plane catalog
//! - [`command`]: outbound START/STOP corrective commands
//! - [`events`]: anomaly events emitted by droplets

pub mod command;
pub mod desired;
pub mod error;
pub mod events;
pub mod ids;
pub mod messages;
pub mod time;

pub use command::{CommandKey, CommandOp, HealthCommand, Priority};
pub use desired::{AppState, DesiredState, PackageState};
pub use error::{ValidationError, ValidationResult};
pub use events::{AnomalyEvent, AnomalyKind, ExtraReason};
pub use ids::{DropletId, ExecutorId, InstanceGuid};
pub use messages::{
    decode, decode_heartbeat, AdvanceTime, DecodedHeartbeat, ExitMessage, ExitReason, Heartbeat, HeartbeatState, InstanceHeartbeat,
    UpdateMessage, Validate,
};
pub use time::Timestamp;
