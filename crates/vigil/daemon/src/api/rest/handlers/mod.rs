//! API request handlers

mod bus;
mod health;

pub use bus::*;
pub use health::*;
