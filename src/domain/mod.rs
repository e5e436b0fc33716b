//! Domain layer - Core data model and port definitions
//!
//! This module defines the driver trait (port) that backend adapters
//! implement, plus the records the state machines operate on.

pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
