//! Per-index instance state machine.
//!
//! ```text
//!   DOWN ──heartbeat──▶ STARTING/RUNNING ──crash──▶ CRASHED ──crash count > death──▶ FLAPPING
//!    ▲                        │
//!    └──── exit for guid ─────┘
//! ```

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use vigil_types::{HeartbeatState, InstanceGuid, InstanceHeartbeat, Timestamp};

use crate::config::StateConfig;

/// Number of recently observed guids kept per index.
pub const GUID_HISTORY_LEN: usize = 3;

/// Lifecycle state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Down,
    Starting,
    Running,
    Crashed,
    Flapping,
    Stopped,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Down => "DOWN",
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::Crashed => "CRASHED",
            InstanceState::Flapping => "FLAPPING",
            InstanceState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// One instance slot of a droplet at a given version and index.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    guid: Option<InstanceGuid>,
    state: InstanceState,
    state_timestamp: Timestamp,
    crash_count: u32,
    last_crash_timestamp: Timestamp,
    last_heartbeat_time: Timestamp,
    guid_history: VecDeque<InstanceGuid>,
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

impl Instance {
    pub fn new() -> Self {
        Self {
            guid: None,
            state: InstanceState::Down,
            state_timestamp: Timestamp::NEVER,
            crash_count: 0,
            last_crash_timestamp: Timestamp::NEVER,
            last_heartbeat_time: Timestamp::NEVER,
            guid_history: VecDeque::with_capacity(GUID_HISTORY_LEN),
        }
    }

    pub fn guid(&self) -> Option<&InstanceGuid> {
        self.guid.as_ref()
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn state_timestamp(&self) -> Timestamp {
        self.state_timestamp
    }

    pub fn crash_count(&self) -> u32 {
        self.crash_count
    }

    pub fn last_crash_timestamp(&self) -> Timestamp {
        self.last_crash_timestamp
    }

    pub fn last_heartbeat_time(&self) -> Timestamp {
        self.last_heartbeat_time
    }

    pub fn guid_history(&self) -> impl Iterator<Item = &InstanceGuid> {
        self.guid_history.iter()
    }

    /// Apply one heartbeat entry received at `now`.
    pub fn receive_heartbeat(&mut self, beat: &InstanceHeartbeat, now: Timestamp) {
        if beat.state.is_running() {
            self.guid_history.push_back(beat.instance_guid.clone());
            self.trim_history();
            self.guid = Some(beat.instance_guid.clone());
            self.state = match beat.state {
                HeartbeatState::Starting => InstanceState::Starting,
                _ => InstanceState::Running,
            };
            self.state_timestamp = beat.state_timestamp;
            self.last_heartbeat_time = now;
        } else {
            self.forget_guid(&beat.instance_guid);
        }
    }

    /// Record a crash that happened at `timestamp`.
    pub fn crash(&mut self, guid: &InstanceGuid, timestamp: Timestamp, config: &StateConfig) {
        if self.last_crash_timestamp.is_set()
            && timestamp.seconds_since(self.last_crash_timestamp)
                > config.flapping_timeout().as_secs_f64()
        {
            self.crash_count = 0;
        }

        self.crash_count = self.crash_count.saturating_add(1);
        self.last_crash_timestamp = timestamp;
        self.state_timestamp = timestamp;
        if self.guid.is_none() {
            self.guid = Some(guid.clone());
        }

        self.state = InstanceState::Crashed;
        if self.crash_count > config.flapping_death {
            self.state = InstanceState::Flapping;
        }
    }

    /// Transition to DOWN if `guid` is the resident one. Returns whether anything changed.
    pub fn mark_down_for_guid(&mut self, guid: &InstanceGuid) -> bool {
        if self.guid.as_ref() != Some(guid) {
            return false;
        }
        self.state = InstanceState::Down;
        self.guid = None;
        self.forget_guid(guid);
        true
    }

    pub fn is_crashed(&self) -> bool {
        matches!(self.state, InstanceState::Crashed | InstanceState::Flapping)
    }

    pub fn is_flapping(&self) -> bool {
        self.state == InstanceState::Flapping
    }

    /// Flapping and last crashed within the flapping restart delay.
    pub fn is_backing_off(&self, now: Timestamp, config: &StateConfig) -> bool {
        self.is_flapping()
            && !self
                .last_crash_timestamp
                .is_older_than(config.flapping_restart_delay(), now)
    }

    pub fn has_heartbeat(&self) -> bool {
        self.last_heartbeat_time.is_set()
    }

    /// Not crashed and heard from within the droplet-lost interval.
    pub fn is_alive(&self, now: Timestamp, config: &StateConfig) -> bool {
        !self.is_crashed()
            && self.has_heartbeat()
            && !self
                .last_heartbeat_time
                .is_older_than(config.droplet_lost(), now)
    }

    /// Alive and last reported as starting or running.
    pub fn is_running(&self, now: Timestamp, config: &StateConfig) -> bool {
        matches!(self.state, InstanceState::Starting | InstanceState::Running)
            && self.is_alive(now, config)
    }

    /// Not alive and nothing already restarting it.
    pub fn is_missing(&self, now: Timestamp, config: &StateConfig, pending_restart: bool) -> bool {
        !self.is_alive(now, config) && !pending_restart
    }

    /// Detect a second copy still running at this index.
    ///
    /// Looks at the last three observed guids `[g0, g1, g2]`. When the two
    /// oldest differ, the first of `g1`, `g0` that is not the current guid is
    /// returned and forgotten, so each copy is reported once per observation.
    pub fn extra_guid_to_prune(&mut self) -> Option<InstanceGuid> {
        if self.guid_history.len() < GUID_HISTORY_LEN {
            return None;
        }
        self.trim_history();

        let oldest = self.guid_history.front()?.clone();
        let middle = self.guid_history.get(1)?.clone();
        if oldest == middle {
            return None;
        }

        let current = self.guid.as_ref();
        let extra = [middle, oldest]
            .into_iter()
            .find(|candidate| Some(candidate) != current)?;
        self.forget_guid(&extra);
        Some(extra)
    }

    fn trim_history(&mut self) {
        while self.guid_history.len() > GUID_HISTORY_LEN {
            self.guid_history.pop_front();
        }
    }

    pub(crate) fn forget_guid(&mut self, guid: &InstanceGuid) {
        self.guid_history.retain(|g| g != guid);
    }
}
