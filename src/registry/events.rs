//! Registry Events
//!
//! Events emitted by the backend registry for consumers that react to
//! backend health changes (metrics, replication, operators).

use serde::{Deserialize, Serialize};

/// Events emitted by the backend registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A backend was loaded from configuration
    BackendRegistered { backend: String, driver: String },

    /// A refresh produced a new capability report
    CapabilitiesRefreshed {
        backend: String,
        free_capacity_gb: f64,
        total_volumes: u64,
    },

    /// A backend is serving on stale or partial information
    BackendDegraded { backend: String, reason: String },

    /// Consecutive refresh failures crossed the threshold
    BackendUnreachable { backend: String, failures: u32 },

    /// A degraded or unreachable backend answered again
    BackendRecovered { backend: String },
}

impl RegistryEvent {
    pub fn backend(&self) -> &str {
        match self {
            RegistryEvent::BackendRegistered { backend, .. }
            | RegistryEvent::CapabilitiesRefreshed { backend, .. }
            | RegistryEvent::BackendDegraded { backend, .. }
            | RegistryEvent::BackendUnreachable { backend, .. }
            | RegistryEvent::BackendRecovered { backend } => backend,
        }
    }
}
