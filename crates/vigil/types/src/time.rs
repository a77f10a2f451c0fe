//! Logical timestamps.
//!
//! All engine time is expressed in seconds. In production the value is
//! anchored to wall-clock seconds since the Unix epoch when the scheduler
//! starts and then advances monotonically; under the virtual scheduler it is
//! whatever the test harness advanced the clock to. A non-positive value
//! means "never set".

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A point in logical time, in seconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    /// Sentinel for a timestamp that was never recorded.
    pub const NEVER: Timestamp = Timestamp(0.0);

    pub const fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    /// Current wall clock time. Use a scheduler's `now()` for ageing checks.
    pub fn now() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        Self(millis as f64 / 1000.0)
    }

    pub const fn as_secs(self) -> f64 {
        self.0
    }

    /// Whether this timestamp carries a real observation.
    pub fn is_set(self) -> bool {
        self.0 > 0.0
    }

    /// Seconds elapsed from `earlier` to `self`.
    pub fn seconds_since(self, earlier: Timestamp) -> f64 {
        self.0 - earlier.0
    }

    /// True when this timestamp is set and lies more than `window` before `now`.
    ///
    /// Unset timestamps are never considered old, so freshly created records
    /// do not trip age-based checks.
    pub fn is_older_than(self, window: Duration, now: Timestamp) -> bool {
        self.is_set() && now.seconds_since(self) > window.as_secs_f64()
    }

    pub fn plus(self, duration: Duration) -> Self {
        Self(self.0 + duration.as_secs_f64())
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}
