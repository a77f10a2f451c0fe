//! Deterministic virtual-time scheduler.
//!
//! Time only moves when the owner advances it. Due tasks are popped one at a
//! time in (fire time, insertion) order so that tasks scheduled while
//! handling a fired task still run within the same advance window.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tracing::trace;
use vigil_types::Timestamp;

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{Receipt, RunningTasks, Scheduler};

#[derive(Debug)]
struct Entry<T> {
    task: T,
    fire_at: Timestamp,
    interval: Option<Duration>,
}

/// Scheduler whose clock is advanced explicitly.
#[derive(Debug)]
pub struct VirtualScheduler<T> {
    now: Timestamp,
    next_receipt: u64,
    next_seq: u64,
    /// (fire_at, seq, receipt); stale entries are skipped against `entries`.
    queue: BinaryHeap<Reverse<(Timestamp, u64, Receipt)>>,
    entries: HashMap<Receipt, Entry<T>>,
    running: RunningTasks,
}

impl<T> Default for VirtualScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> VirtualScheduler<T> {
    /// Create a scheduler with its clock at zero.
    pub fn new() -> Self {
        Self::starting_at(Timestamp::NEVER)
    }

    pub fn starting_at(now: Timestamp) -> Self {
        Self {
            now,
            next_receipt: 0,
            next_seq: 0,
            queue: BinaryHeap::new(),
            entries: HashMap::new(),
            running: RunningTasks::new(),
        }
    }

    /// Number of scheduled tasks that have not been cancelled.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Deadline `by` from the current virtual time.
    pub fn deadline(&self, by: Duration) -> Timestamp {
        self.now.plus(by)
    }

    /// Move the clock to `until` once all due tasks have been handled.
    pub fn settle(&mut self, until: Timestamp) -> SchedulerResult<()> {
        if until < self.now {
            return Err(SchedulerError::ClockRegression {
                now: self.now,
                requested: until,
            });
        }
        self.now = until;
        Ok(())
    }

    fn schedule_at(&mut self, fire_at: Timestamp, interval: Option<Duration>, task: T) -> Receipt {
        let receipt = Receipt::new(self.next_receipt);
        self.next_receipt += 1;
        self.entries.insert(
            receipt,
            Entry {
                task,
                fire_at,
                interval,
            },
        );
        self.push(fire_at, receipt);
        receipt
    }

    fn push(&mut self, fire_at: Timestamp, receipt: Receipt) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse((fire_at, seq, receipt)));
    }
}

impl<T: Clone> VirtualScheduler<T> {
    /// Pop the next task due at or before `until`, moving the clock to its
    /// fire time. Periodic tasks are re-armed.
    pub fn next_due(&mut self, until: Timestamp) -> Option<T> {
        while let Some(Reverse((fire_at, _, receipt))) = self.queue.peek().copied() {
            if fire_at > until {
                return None;
            }
            self.queue.pop();

            let Some(entry) = self.entries.get_mut(&receipt) else {
                continue;
            };
            if entry.fire_at != fire_at {
                continue;
            }

            if fire_at > self.now {
                self.now = fire_at;
            }
            trace!(receipt = %receipt, at = %fire_at, "Virtual task fired");

            let interval = entry.interval;
            match interval {
                Some(interval) => {
                    let next = fire_at.plus(interval);
                    entry.fire_at = next;
                    let task = entry.task.clone();
                    self.push(next, receipt);
                    return Some(task);
                }
                None => {
                    return self.entries.remove(&receipt).map(|entry| entry.task);
                }
            }
        }
        None
    }

    /// Advance the clock by `by`, returning every task that fired in order.
    ///
    /// Tasks scheduled by the caller in response are not seen by this call;
    /// use [`next_due`](Self::next_due) to interleave handling.
    pub fn advance(&mut self, by: Duration) -> Vec<T> {
        let until = self.deadline(by);
        let mut fired = Vec::new();
        while let Some(task) = self.next_due(until) {
            fired.push(task);
        }
        self.now = until;
        fired
    }
}

impl<T: Clone> Scheduler<T> for VirtualScheduler<T> {
    fn now(&self) -> Timestamp {
        self.now
    }

    fn immediately(&mut self, task: T) -> Receipt {
        self.schedule_at(self.now, None, task)
    }

    fn after(&mut self, delay: Duration, task: T) -> Receipt {
        let fire_at = self.now.plus(delay);
        self.schedule_at(fire_at, None, task)
    }

    fn every_after(
        &mut self,
        first_delay: Duration,
        interval: Duration,
        task: T,
    ) -> SchedulerResult<Receipt> {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }
        let fire_at = self.now.plus(first_delay);
        Ok(self.schedule_at(fire_at, Some(interval), task))
    }

    fn cancel(&mut self, receipt: Receipt) {
        self.entries.remove(&receipt);
    }

    fn running(&mut self) -> &mut RunningTasks {
        &mut self.running
    }

    fn as_virtual(&mut self) -> Option<&mut VirtualScheduler<T>> {
        Some(self)
    }
}
