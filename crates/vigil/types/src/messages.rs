//! Inbound event payloads consumed by the engine.
//!
//! Field names follow the executor wire format (`droplet`, `instance`, ...);
//! the long-form names are accepted as aliases.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};
use crate::ids::{DropletId, ExecutorId, InstanceGuid};
use crate::time::Timestamp;

/// State an executor reports for one of its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartbeatState {
    Starting,
    Running,
    Stopped,
    Crashed,
    Deleted,
    Down,
}

impl HeartbeatState {
    /// Whether the reported process is alive on the executor.
    pub fn is_running(self) -> bool {
        matches!(self, HeartbeatState::Starting | HeartbeatState::Running)
    }
}

/// One instance entry inside an executor heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHeartbeat {
    #[serde(rename = "droplet", alias = "droplet_id")]
    pub droplet_id: DropletId,
    pub version: String,
    pub index: u32,
    #[serde(rename = "instance", alias = "instance_guid")]
    pub instance_guid: InstanceGuid,
    pub state: HeartbeatState,
    #[serde(default)]
    pub state_timestamp: Timestamp,
}

/// Periodic report of everything one executor runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "dea", alias = "executor_id")]
    pub executor_id: ExecutorId,
    #[serde(default)]
    pub droplets: Vec<InstanceHeartbeat>,
}

/// Why an instance exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Crashed,
    Stopped,
    DeaShutdown,
    DeaEvacuation,
}

impl ExitReason {
    /// Exits caused by the executor going away rather than the app itself.
    pub fn is_executor_exit(self) -> bool {
        matches!(self, ExitReason::DeaShutdown | ExitReason::DeaEvacuation)
    }
}

/// Instance exit notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitMessage {
    #[serde(rename = "droplet", alias = "droplet_id")]
    pub droplet_id: DropletId,
    pub version: String,
    pub index: u32,
    #[serde(rename = "instance", alias = "instance_guid")]
    pub instance_guid: InstanceGuid,
    pub reason: ExitReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_timestamp: Option<Timestamp>,
}

/// Externally triggered redeploy/restart of a droplet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    #[serde(rename = "droplet", alias = "droplet_id")]
    pub droplet_id: DropletId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(
        default,
        rename = "instance",
        alias = "instance_guid",
        skip_serializing_if = "Option::is_none"
    )]
    pub instance_guid: Option<InstanceGuid>,
}

/// Virtual clock control, only honoured by the virtual scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdvanceTime {
    pub seconds: f64,
}

/// Structural checks beyond what deserialization enforces.
pub trait Validate {
    fn validate(&self) -> ValidationResult<()>;
}

impl Validate for InstanceHeartbeat {
    fn validate(&self) -> ValidationResult<()> {
        if self.droplet_id.is_empty() {
            return Err(ValidationError::MissingField("droplet"));
        }
        if self.version.is_empty() {
            return Err(ValidationError::MissingField("version"));
        }
        if self.instance_guid.is_empty() {
            return Err(ValidationError::MissingField("instance"));
        }
        Ok(())
    }
}

impl Validate for Heartbeat {
    fn validate(&self) -> ValidationResult<()> {
        self.droplets.iter().try_for_each(Validate::validate)
    }
}

/// Heartbeat envelope with entries left undecoded.
#[derive(Deserialize)]
struct RawHeartbeat {
    #[serde(rename = "dea", alias = "executor_id")]
    executor_id: ExecutorId,
    #[serde(default)]
    droplets: Vec<serde_json::Value>,
}

/// A heartbeat whose entries were checked one by one.
#[derive(Debug)]
pub struct DecodedHeartbeat {
    pub heartbeat: Heartbeat,
    /// Position in the original payload and the reason each dropped entry failed.
    pub rejected: Vec<(usize, ValidationError)>,
}

/// Decode a heartbeat, dropping only the entries that are malformed.
///
/// The envelope itself must still parse and name its executor.
pub fn decode_heartbeat(payload: &[u8]) -> ValidationResult<DecodedHeartbeat> {
    let raw: RawHeartbeat = serde_json::from_slice(payload)?;
    if raw.executor_id.is_empty() {
        return Err(ValidationError::MissingField("dea"));
    }

    let mut droplets = Vec::with_capacity(raw.droplets.len());
    let mut rejected = Vec::new();
    for (position, entry) in raw.droplets.into_iter().enumerate() {
        let checked = serde_json::from_value::<InstanceHeartbeat>(entry)
            .map_err(ValidationError::from)
            .and_then(|beat| beat.validate().map(|()| beat));
        match checked {
            Ok(beat) => droplets.push(beat),
            Err(err) => rejected.push((position, err)),
        }
    }

    Ok(DecodedHeartbeat {
        heartbeat: Heartbeat {
            executor_id: raw.executor_id,
            droplets,
        },
        rejected,
    })
}

impl Validate for ExitMessage {
    fn validate(&self) -> ValidationResult<()> {
        if self.droplet_id.is_empty() {
            return Err(ValidationError::MissingField("droplet"));
        }
        if self.instance_guid.is_empty() {
            return Err(ValidationError::MissingField("instance"));
        }
        Ok(())
    }
}

impl Validate for UpdateMessage {
    fn validate(&self) -> ValidationResult<()> {
        if self.droplet_id.is_empty() {
            return Err(ValidationError::MissingField("droplet"));
        }
        Ok(())
    }
}

impl Validate for AdvanceTime {
    fn validate(&self) -> ValidationResult<()> {
        if !self.seconds.is_finite() || self.seconds < 0.0 {
            return Err(ValidationError::InvalidValue {
                field: "seconds",
                reason: format!("must be a non-negative number, got {}", self.seconds),
            });
        }
        Ok(())
    }
}

/// Decode and validate a JSON payload.
pub fn decode<T>(payload: &[u8]) -> ValidationResult<T>
where
    T: DeserializeOwned + Validate,
{
    let message: T = serde_json::from_slice(payload)?;
    message.validate()?;
    Ok(message)
}
