//! # Vigil State - What the engine believes is running
//!
//! - [`Instance`]: per-index state machine with crash counting and flapping
//! - [`Droplet`]: every instance of one application, its desired state, and
//!   missing/extra detection
//! - [`DropletRegistry`]: lazily populated map of droplets with a GC sweep
//!
//! Nothing here touches a clock or a channel. Callers pass `now` in, which
//! is what lets the engine run on virtual time.

pub mod config;
pub mod droplet;
pub mod error;
pub mod instance;
pub mod registry;

pub use config::StateConfig;
pub use droplet::{CrashRecord, Droplet, DropletSummary, InstanceSummary, RestartReceipt};
pub use error::{StateError, StateResult};
pub use instance::{Instance, InstanceState, GUID_HISTORY_LEN};
pub use registry::DropletRegistry;
