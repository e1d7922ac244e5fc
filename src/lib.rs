//! vvcam-bridge - capture-session event bridge
//!
//! Connects video capture consumers to a user-space camera pipeline: buffer
//! management over a reserved memory region, an event channel with
//! synchronous completion, and per-session streaming state.

pub mod bridge;
pub mod config;
pub mod error;
pub mod status;
pub mod utils;
pub mod video;

pub use error::{BridgeError, Result};
