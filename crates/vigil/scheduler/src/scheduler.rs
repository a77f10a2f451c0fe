//! The scheduling abstraction shared by both clocks.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use vigil_types::Timestamp;

use crate::error::SchedulerResult;
use crate::virtual_time::VirtualScheduler;

/// Handle to a scheduled task, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Receipt(u64);

impl Receipt {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// Drives time-based work for the engine.
///
/// Fired tasks are handed back to the owner as values of `T`; the owner
/// runs them to completion one at a time.
pub trait Scheduler<T> {
    /// Current time on this scheduler's clock.
    fn now(&self) -> Timestamp;

    /// Run `task` on the next tick.
    fn immediately(&mut self, task: T) -> Receipt;

    /// Run `task` once after `delay`.
    fn after(&mut self, delay: Duration, task: T) -> Receipt;

    /// Run `task` every `interval`, first after `first_delay`.
    fn every_after(
        &mut self,
        first_delay: Duration,
        interval: Duration,
        task: T,
    ) -> SchedulerResult<Receipt>;

    /// Run `task` every `interval`.
    fn every(&mut self, interval: Duration, task: T) -> SchedulerResult<Receipt> {
        self.every_after(interval, interval, task)
    }

    /// Cancel a task that has not fired yet. Unknown or fired receipts are ignored.
    fn cancel(&mut self, receipt: Receipt);

    /// Guard for long-running, paced tasks.
    fn running(&mut self) -> &mut RunningTasks;

    /// Access to virtual-time controls, if this scheduler has them.
    fn as_virtual(&mut self) -> Option<&mut VirtualScheduler<T>> {
        None
    }
}

/// Tracks tasks that span several ticks so they never overlap.
#[derive(Debug, Default)]
pub struct RunningTasks {
    running: HashMap<&'static str, Timestamp>,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `name` as running. Returns false if it already is.
    pub fn try_begin(&mut self, name: &'static str, now: Timestamp) -> bool {
        if self.running.contains_key(name) {
            return false;
        }
        self.running.insert(name, now);
        true
    }

    /// Mark `name` as finished, returning when it started.
    pub fn finish(&mut self, name: &'static str) -> Option<Timestamp> {
        self.running.remove(name)
    }

    pub fn is_running(&self, name: &'static str) -> bool {
        self.running.contains_key(name)
    }

    pub fn started_at(&self, name: &'static str) -> Option<Timestamp> {
        self.running.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_tasks_guard() {
        let mut tasks = RunningTasks::new();
        let t0 = Timestamp::from_secs(10.0);

        assert!(tasks.try_begin("analysis", t0));
        assert!(!tasks.try_begin("analysis", Timestamp::from_secs(11.0)));
        assert_eq!(tasks.started_at("analysis"), Some(t0));

        assert_eq!(tasks.finish("analysis"), Some(t0));
        assert!(!tasks.is_running("analysis"));
        assert!(tasks.try_begin("analysis", Timestamp::from_secs(12.0)));
    }

    #[test]
    fn test_finish_unknown_task_is_noop() {
        let mut tasks = RunningTasks::new();
        assert_eq!(tasks.finish("nothing"), None);
    }
}
