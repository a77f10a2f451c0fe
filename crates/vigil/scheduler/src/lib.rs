//! # Vigil Scheduler - Time abstraction for the reconciliation engine
//!
//! The engine never sleeps or spawns timers itself. It asks a [`Scheduler`]
//! to deliver task values later and runs them when they come back.
//!
//! Two implementations:
//!
//! - [`TokioScheduler`]: wall clock, tasks delivered through an mpsc channel
//! - [`VirtualScheduler`]: deterministic clock advanced by the caller, used by
//!   tests and by the daemon's `--virtual-time` mode
//!
//! ```rust
//! use std::time::Duration;
//! use vigil_scheduler::{Scheduler, VirtualScheduler};
//!
//! let mut sched = VirtualScheduler::new();
//! sched.every(Duration::from_secs(10), "analyze").unwrap();
//! assert_eq!(sched.advance(Duration::from_secs(20)), vec!["analyze", "analyze"]);
//! ```

pub mod error;
pub mod realtime;
pub mod scheduler;
pub mod virtual_time;

pub use error::{SchedulerError, SchedulerResult};
pub use realtime::TokioScheduler;
pub use scheduler::{Receipt, RunningTasks, Scheduler};
pub use virtual_time::VirtualScheduler;
