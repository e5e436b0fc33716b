//! Volume Orchestrator - Block storage backend driver core
//!
//! Places volumes on pluggable storage backends and drives them through
//! their lifecycle, including snapshots, exports and replication failover.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                             Volume Service                                  │
//! │              (worker pool, metrics, background refresh)                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │     Volume      │  │   Scheduler     │  │       Replication           │  │
//! │  │  State Machine  │  │ (filter/weigh)  │  │   Failover Coordinator      │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                  │
//! │           └────────────────────┼─────────────────────────┘                  │
//! │                                │                                            │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │   Backend Registry    │                                │
//! │                    │ (capability reports)  │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                         Volume Drivers                                      │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │   Memory (iSCSI/FC/NVMe)    │  │        File (NFS images)            │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Service facade, configuration, drivers, workers, metrics
//! - [`domain`]: Driver trait and the records the core operates on
//! - [`registry`]: Configured backends and their health
//! - [`scheduler`]: Volume placement
//! - [`volume`]: Volume lifecycle and reconciliation
//! - [`replication`]: Replication pairs, failover and failback
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod domain;
pub mod error;
pub mod registry;
pub mod replication;
pub mod scheduler;
pub mod volume;

// Re-export commonly used types
pub use controlplane::{
    BackendFactory, DriverKind, GuardedDriver, ServiceConfig, ServiceStatus, VolumeService,
};

pub use domain::model::{Attachment, Snapshot, SnapshotStatus, Volume, VolumeSource, VolumeType};
pub use domain::ports::{
    CapabilityReport, ConnectionInfo, FailoverTarget, HostDescriptor, Protocol, VolumeDriver,
    VolumeDriverRef,
};

pub use error::{Error, ErrorKind, FailureDisposition, Result};

pub use registry::{Backend, BackendHealth, BackendRegistry, RegistryConfig};
pub use replication::{FailoverCoordinator, FailoverOutcome, PairState};
pub use scheduler::{PlacementRequest, Scheduler, SchedulerConfig};
pub use volume::{CreateVolumeRequest, LockMode, VolumeManager, VolumeStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
