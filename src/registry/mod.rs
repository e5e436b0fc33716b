//! Backend Registry Module
//!
//! Tracks configured backends, their capability reports and health, and
//! runs the per-backend refresh loops.

pub mod backend_registry;
pub mod events;

pub use backend_registry::*;
pub use events::*;
