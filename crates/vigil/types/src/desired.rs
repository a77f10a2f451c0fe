//! Desired state as reported by the control-plane catalog.

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

/// Start/stop intent for an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    Started,
    Stopped,
}

/// Staging status of the application package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageState {
    Staged,
    Pending,
    Failed,
}

/// Authoritative target for one droplet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(rename = "instances", alias = "num_instances")]
    pub num_instances: u32,
    pub state: AppState,
    #[serde(rename = "version", alias = "live_version")]
    pub live_version: String,
    pub package_state: PackageState,
    #[serde(rename = "updated_at", alias = "last_updated", default)]
    pub last_updated: Timestamp,
}

impl DesiredState {
    /// Whether instances of this droplet are expected to run at all.
    pub fn wants_instances(&self) -> bool {
        self.state == AppState::Started && self.package_state == PackageState::Staged
    }

    pub fn is_stopped(&self) -> bool {
        self.state == AppState::Stopped
    }
}
