//! Volume Lifecycle
//!
//! - State: status enum and the legal transition table
//! - Locks: per-volume FIFO serialization
//! - Manager: create, delete, extend, retype, snapshot, attach, detach
//! - Reconcile: resolves driver calls whose outcome was unknown

pub mod locks;
pub mod manager;
pub mod reconcile;
pub mod state;

#[cfg(test)]
mod fuzz;

pub use locks::{LockMode, VolumeGuard, VolumeLocks};
pub use manager::{CreateVolumeRequest, VolumeManager, PROVISIONING_SPEC};
pub use reconcile::ReconcileReport;
pub use state::VolumeStatus;
