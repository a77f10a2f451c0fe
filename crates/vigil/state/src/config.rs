//! Thresholds governing instance and droplet state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing windows and limits for the state machines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Seconds without a heartbeat after which an instance is considered lost.
    pub droplet_lost_secs: u64,

    /// Crashes further apart than this reset the crash counter.
    pub flapping_timeout_secs: u64,

    /// An instance is flapping once its crash count exceeds this.
    pub flapping_death: u32,

    /// A flapping instance is held down this long after its last crash before
    /// it is reported missing again.
    pub flapping_restart_delay_secs: u64,

    /// Seconds without desired-state confirmation before a droplet may be collected.
    pub gc_grace_period_secs: u64,

    /// Age after which crash records are pruned.
    pub crash_retention_secs: u64,

    /// Missing-instance detection is suppressed this long after a reset.
    pub reset_window_secs: u64,

    /// A pending restart expires after this many seconds without confirmation.
    pub restart_timeout_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            droplet_lost_secs: 30,
            flapping_timeout_secs: 180,
            flapping_death: 1,
            flapping_restart_delay_secs: 60,
            gc_grace_period_secs: 240,
            crash_retention_secs: 180,
            reset_window_secs: 15,
            restart_timeout_secs: 20,
        }
    }
}

impl StateConfig {
    pub fn droplet_lost(&self) -> Duration {
        Duration::from_secs(self.droplet_lost_secs)
    }

    pub fn flapping_timeout(&self) -> Duration {
        Duration::from_secs(self.flapping_timeout_secs)
    }

    pub fn flapping_restart_delay(&self) -> Duration {
        Duration::from_secs(self.flapping_restart_delay_secs)
    }

    pub fn gc_grace_period(&self) -> Duration {
        Duration::from_secs(self.gc_grace_period_secs)
    }

    pub fn crash_retention(&self) -> Duration {
        Duration::from_secs(self.crash_retention_secs)
    }

    pub fn reset_window(&self) -> Duration {
        Duration::from_secs(self.reset_window_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }
}
