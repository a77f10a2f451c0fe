//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_state::StateConfig;

/// Cadences of the time-driven work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalsConfig {
    /// How often the command queue is drained.
    pub request_queue_secs: u64,

    /// How often a full-registry analysis pass starts.
    pub droplets_analysis_secs: u64,

    /// How often desired state is refreshed.
    pub desired_state_update_secs: u64,

    /// Desired state older than this counts as unavailable.
    pub desired_state_lost_secs: u64,

    /// Delay of a refresh postponed behind one already in flight.
    pub postpone_secs: u64,

    /// How often ripe droplets are collected.
    pub gc_secs: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            request_queue_secs: 1,
            droplets_analysis_secs: 10,
            desired_state_update_secs: 60,
            desired_state_lost_secs: 180,
            postpone_secs: 2,
            gc_secs: 60,
        }
    }
}

impl IntervalsConfig {
    pub fn request_queue(&self) -> Duration {
        Duration::from_secs(self.request_queue_secs)
    }

    pub fn droplets_analysis(&self) -> Duration {
        Duration::from_secs(self.droplets_analysis_secs)
    }

    pub fn desired_state_update(&self) -> Duration {
        Duration::from_secs(self.desired_state_update_secs)
    }

    pub fn desired_state_lost(&self) -> Duration {
        Duration::from_secs(self.desired_state_lost_secs)
    }

    pub fn postpone(&self) -> Duration {
        Duration::from_secs(self.postpone_secs)
    }

    pub fn gc(&self) -> Duration {
        Duration::from_secs(self.gc_secs)
    }
}

/// What the publish step does with a dequeued command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowMode {
    /// Publish to the command subject.
    #[default]
    Live,
    /// Log only.
    Shadow,
    /// Publish to the shadow subject instead of the command subject.
    Mirror,
}

impl std::str::FromStr for ShadowMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Ok(ShadowMode::Live),
            "shadow" => Ok(ShadowMode::Shadow),
            "mirror" => Ok(ShadowMode::Mirror),
            other => Err(format!("unknown shadow mode: {other}")),
        }
    }
}

/// Bus subjects the engine listens and publishes on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub heartbeat: String,
    pub exited: String,
    pub updated: String,
    pub advance_time: String,
    pub status: String,
    pub health: String,
    pub commands: String,
    pub shadow_commands: String,
    pub credentials: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            heartbeat: "dea.heartbeat".to_string(),
            exited: "droplet.exited".to_string(),
            updated: "droplet.updated".to_string(),
            advance_time: "healthmanager.advance_time".to_string(),
            status: "healthmanager.status".to_string(),
            health: "healthmanager.health".to_string(),
            commands: "cloudcontrollers.hm.requests.default".to_string(),
            shadow_commands: "healthmanager.shadow.requests".to_string(),
            credentials: "cloudcontroller.bulk.credentials.default".to_string(),
        }
    }
}

impl Topics {
    /// Subjects the engine consumes.
    pub fn inbound(&self) -> [&str; 6] {
        [
            &self.heartbeat,
            &self.exited,
            &self.updated,
            &self.advance_time,
            &self.status,
            &self.health,
        ]
    }
}

/// Everything the engine needs to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub intervals: IntervalsConfig,

    /// Commands published per drain.
    pub queue_batch_size: usize,

    /// Droplets analyzed per step of an analysis pass.
    pub analysis_batch_size: usize,

    pub shadow_mode: ShadowMode,

    pub topics: Topics,

    pub state: StateConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            intervals: IntervalsConfig::default(),
            queue_batch_size: 40,
            analysis_batch_size: 200,
            shadow_mode: ShadowMode::default(),
            topics: Topics::default(),
            state: StateConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.queue_batch_size, 40);
        assert_eq!(config.analysis_batch_size, 200);
        assert_eq!(config.intervals.request_queue(), Duration::from_secs(1));
        assert_eq!(config.shadow_mode, ShadowMode::Live);
        assert_eq!(config.topics.heartbeat, "dea.heartbeat");
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{"shadow_mode": "mirror", "intervals": {"gc_secs": 5}}"#)
                .unwrap();

        assert_eq!(config.shadow_mode, ShadowMode::Mirror);
        assert_eq!(config.intervals.gc_secs, 5);
        assert_eq!(config.intervals.postpone_secs, 2);
        assert_eq!(config.queue_batch_size, 40);
    }

    #[test]
    fn test_shadow_mode_from_str() {
        assert_eq!("Shadow".parse::<ShadowMode>(), Ok(ShadowMode::Shadow));
        assert!("loud".parse::<ShadowMode>().is_err());
    }
}
