//! Application state for API handlers

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use vigil_control::{EngineSnapshot, MessageBus};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Bus the engine is attached to
    pub bus: Arc<dyn MessageBus>,

    /// Latest engine snapshot
    pub snapshots: watch::Receiver<EngineSnapshot>,

    /// Upper bound for bus requests issued through the API
    pub request_timeout: Duration,

    /// Daemon version
    pub version: String,

    /// Daemon start time
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        snapshots: watch::Receiver<EngineSnapshot>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            snapshots,
            request_timeout,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: chrono::Utc::now(),
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Get uptime as a human-readable string
    pub fn uptime(&self) -> String {
        let secs = (chrono::Utc::now() - self.started_at).num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else if secs < 86400 {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        } else {
            format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
        }
    }
}
