//! REST endpoints for introspection and bus injection

pub mod handlers;
pub mod router;
pub mod state;
