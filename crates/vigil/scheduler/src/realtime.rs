//! Wall-clock scheduler backed by the tokio timer.
//!
//! Every scheduled task is a small tokio task that sleeps and then sends the
//! task value into the owner's channel. The owner's event loop receives it
//! and runs it, so all handling stays on the owner's single logical thread.
//!
//! `now()` is wall-clock time at construction plus monotonic time elapsed
//! since, so stepping the system clock does not age or rejuvenate records.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;
use vigil_types::Timestamp;

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{Receipt, RunningTasks, Scheduler};

/// Real-time scheduler delivering fired tasks through an mpsc channel.
pub struct TokioScheduler<T> {
    origin: Timestamp,
    started: Instant,
    tx: mpsc::UnboundedSender<T>,
    handles: Arc<DashMap<Receipt, AbortHandle>>,
    next_receipt: u64,
    running: RunningTasks,
}

impl<T: Send + 'static> TokioScheduler<T> {
    /// Create a scheduler delivering into `tx`.
    pub fn new(tx: mpsc::UnboundedSender<T>) -> Self {
        Self {
            origin: Timestamp::now(),
            started: Instant::now(),
            tx,
            handles: Arc::new(DashMap::new()),
            next_receipt: 0,
            running: RunningTasks::new(),
        }
    }

    /// Create a scheduler together with the receiver its tasks arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Number of timers that have not fired or been cancelled.
    pub fn pending(&self) -> usize {
        self.handles.len()
    }

    fn next_receipt(&mut self) -> Receipt {
        let receipt = Receipt::new(self.next_receipt);
        self.next_receipt += 1;
        receipt
    }

    fn track(&self, receipt: Receipt, handle: AbortHandle) {
        self.handles.insert(receipt, handle.clone());
        // The timer may already have fired before it was tracked.
        if handle.is_finished() {
            self.handles.remove(&receipt);
        }
    }
}

impl<T: Clone + Send + 'static> Scheduler<T> for TokioScheduler<T> {
    fn now(&self) -> Timestamp {
        self.origin.plus(self.started.elapsed())
    }

    fn immediately(&mut self, task: T) -> Receipt {
        self.after(Duration::ZERO, task)
    }

    fn after(&mut self, delay: Duration, task: T) -> Receipt {
        let receipt = self.next_receipt();
        let tx = self.tx.clone();
        let handles = Arc::clone(&self.handles);

        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            handles.remove(&receipt);
            if tx.send(task).is_err() {
                debug!(receipt = %receipt, "Scheduler receiver dropped before task fired");
            }
        });

        self.track(receipt, handle.abort_handle());
        receipt
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

        let receipt = self.next_receipt();
        let tx = self.tx.clone();
        let handles = Arc::clone(&self.handles);

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + first_delay, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(task.clone()).is_err() {
                    debug!(receipt = %receipt, "Scheduler receiver dropped, stopping periodic task");
                    handles.remove(&receipt);
                    break;
                }
            }
        });

        self.track(receipt, handle.abort_handle());
        Ok(receipt)
    }

    fn cancel(&mut self, receipt: Receipt) {
        if let Some((_, handle)) = self.handles.remove(&receipt) {
            handle.abort();
        }
    }

    fn running(&mut self) -> &mut RunningTasks {
        &mut self.running
    }
}

impl<T> Drop for TokioScheduler<T> {
    fn drop(&mut self) {
        for entry in self.handles.iter() {
            entry.value().abort();
        }
    }
}
