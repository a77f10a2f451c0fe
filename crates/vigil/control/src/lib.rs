//! # Vigil Control - Reconciliation loop
//!
//! Turns anomalies detected in [`vigil_state`] into START/STOP commands.
//!
//! ## Key Components
//!
//! - [`HealthManager`]: single-task engine that owns the registry and the
//!   scheduler, consumes bus messages, and runs periodic work
//! - [`Harmonizer`]: policy table, refresh gating, paced analysis and GC
//! - [`Nudger`]: prioritized, deduplicating command queue drained in batches
//! - [`Reporter`]: status and health replies over request/reply
//! - [`MessageBus`] / [`DesiredStateProvider`]: the two seams to the outside
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vigil_control::{
//!     HealthManager, InMemoryBus, InMemoryDesiredStateProvider, ManagerConfig,
//! };
//! use vigil_types::Timestamp;
//!
//! # fn example() -> vigil_control::ControlResult<()> {
//! let mut manager = HealthManager::virtual_time(
//!     ManagerConfig::default(),
//!     Arc::new(InMemoryBus::new()),
//!     Arc::new(InMemoryDesiredStateProvider::new()),
//!     Timestamp::from_secs(1_000.0),
//! );
//! manager.prepare()?;
//! manager.advance_time(Duration::from_secs(60))?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod harmonizer;
pub mod manager;
pub mod nudger;
pub mod provider;
pub mod reporter;

pub use bus::{BusMessage, InMemoryBus, MessageBus};
pub use config::{IntervalsConfig, ManagerConfig, ShadowMode, Topics};
pub use error::{
    BusError, BusResult, ControlError, ControlResult, ProviderError, ProviderResult,
};
pub use harmonizer::{
    Availability, Followup, Harmonizer, PolicyAction, PolicyTable, RefreshGate, Task,
    ANALYSIS_TASK,
};
pub use manager::{EngineSnapshot, HealthManager, Input};
pub use nudger::{Nudger, NudgerStats};
pub use provider::{DesiredStateProvider, DropletSink, InMemoryDesiredStateProvider};
pub use reporter::{
    HealthEntry, HealthQuery, HealthRequest, Reporter, StatusReply, StatusRequest,
};
