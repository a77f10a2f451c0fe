//! Vigil daemon library
//!
//! This module provides the pieces `vigild` is assembled from:
//! - Layered configuration
//! - The bulk HTTP desired-state provider
//! - REST API for introspection and bus injection
//! - Server lifecycle management

pub mod api;
pub mod bulk;
pub mod config;
pub mod error;
pub mod server;

pub use bulk::BulkDesiredStateProvider;
pub use config::{BulkConfig, BulkCredentials, DaemonConfig, LoggingConfig, ServerConfig};
pub use error::{ApiError, ApiResult, DaemonError, DaemonResult};
pub use server::Server;
