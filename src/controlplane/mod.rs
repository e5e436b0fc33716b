//! Control Plane Module
//!
//! Service wiring around the volume core: configuration, driver backends,
//! the operation worker pool, metrics and the [`VolumeService`] facade.

pub mod backends;
pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod workers;

pub use backends::{BackendFactory, CallPolicy, DriverKind, GuardedDriver};
pub use config::{BackendSection, ReplicationDevice, ServiceConfig};
pub use metrics::ServiceMetrics;
pub use orchestrator::{start_from_file, BackendStatus, ServiceStatus, VolumeService};
pub use workers::{JobHandle, WorkerConfig, WorkerPool, WorkerStats};
