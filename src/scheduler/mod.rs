//! Volume Placement
//!
//! Filter-weigher scheduling of new volumes onto backends:
//! - Filters: availability, backend name, capacity, capabilities
//! - Weigher: normalized free capacity and load
//! - Placement: create on the winner, retry once elsewhere on unavailability

pub mod extra_specs;
pub mod filters;
pub mod scheduler;
pub mod weigher;

pub use filters::{default_filters, BackendFilter};
pub use scheduler::{rank_with, Placement, Scheduler, SchedulerConfig};
pub use weigher::{WeighedBackend, WeigherConfig};

use crate::domain::model::ExtraSpecs;
use std::collections::BTreeSet;

/// What a new volume needs from its backend
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub size_gb: u64,
    pub extra_specs: ExtraSpecs,
    pub thin: bool,
    /// Set when the volume has a source that lives on a specific backend
    pub pinned_backend: Option<String>,
    /// Backends whose replication pair is in transition
    pub exclude: BTreeSet<String>,
}
