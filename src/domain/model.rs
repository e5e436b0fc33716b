//! Domain Model - Volumes, snapshots, attachments and replication pairs
//!
//! These records are owned and mutated by the volume manager and the
//! replication coordinator. Everything here is plain data.

use crate::domain::ports::{ConnectionInfo, HostDescriptor, SnapshotHandle, VolumeHandle};
use crate::volume::state::VolumeStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// String-keyed bag attached to a volume type
pub type ExtraSpecs = BTreeMap<String, String>;

/// Extra-spec that pins placement to a backend
pub const BACKEND_NAME_SPEC: &str = "volume_backend_name";

/// Extra-spec that permits attaching to more than one host
pub const MULTIATTACH_SPEC: &str = "multiattach";

/// Extra-spec that requests a replicated volume
pub const REPLICATION_SPEC: &str = "replication_enabled";

// =============================================================================
// Volume Type
// =============================================================================

/// Named set of extra-specs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeType {
    pub name: String,
    pub extra_specs: ExtraSpecs,
}

impl VolumeType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra_specs: ExtraSpecs::new(),
        }
    }

    pub fn with_spec(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_specs.insert(key.into(), value.into());
        self
    }

    /// Check an `<is> True` style boolean spec
    pub fn is_enabled(&self, key: &str) -> bool {
        self.extra_specs
            .get(key)
            .map(|v| spec_is_true(v))
            .unwrap_or(false)
    }

    pub fn allows_multiattach(&self) -> bool {
        self.is_enabled(MULTIATTACH_SPEC)
    }

    pub fn wants_replication(&self) -> bool {
        self.is_enabled(REPLICATION_SPEC)
    }
}

/// Interpret `<is> True`, `True`, `true` as enabled
pub fn spec_is_true(value: &str) -> bool {
    let v = value.trim();
    let v = v.strip_prefix("<is>").map(str::trim).unwrap_or(v);
    v.eq_ignore_ascii_case("true")
}

// =============================================================================
// Volume
// =============================================================================

/// Where a volume's initial content came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum VolumeSource {
    None,
    Snapshot(String),
    Volume(String),
}

impl VolumeSource {
    pub fn snapshot_id(&self) -> Option<&str> {
        match self {
            VolumeSource::Snapshot(id) => Some(id),
            _ => None,
        }
    }

    pub fn volume_id(&self) -> Option<&str> {
        match self {
            VolumeSource::Volume(id) => Some(id),
            _ => None,
        }
    }
}

/// Driver operation that was interrupted with an unknown remote outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InterruptedOperation {
    Create,
    Delete,
    Extend { new_size_gb: u64 },
    Attach { host: HostDescriptor },
    Detach { host: HostDescriptor },
}

/// Why a volume is in `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeFault {
    pub reason: String,
    /// Set while reconciliation still has to probe the array
    pub pending: Option<InterruptedOperation>,
    pub at: DateTime<Utc>,
}

/// Ties a volume to one consumer host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub host: HostDescriptor,
    pub connection_info: ConnectionInfo,
    pub ref_count: u32,
    /// Data path predates a failover and must be re-established
    pub stale: bool,
    pub attached_at: DateTime<Utc>,
}

/// Logical block device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub display_name: String,
    pub size_gb: u64,
    pub status: VolumeStatus,
    /// Assigned by the scheduler, immutable once status leaves `creating`
    pub backend: Option<String>,
    /// Replication side the volume is served from, `None` on the primary
    pub active_backend_id: Option<String>,
    pub volume_type: VolumeType,
    pub thin: bool,
    pub replication_enabled: bool,
    pub source: VolumeSource,
    pub provider: Option<VolumeHandle>,
    pub attachments: Vec<Attachment>,
    pub fault: Option<VolumeFault>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Volume {
    /// Sum of attachment reference counts
    pub fn ref_count(&self) -> u32 {
        self.attachments.iter().map(|a| a.ref_count).sum()
    }

    pub fn attachment_for(&self, host: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.host.host == host)
    }

    pub fn needs_verification(&self) -> bool {
        self.fault.as_ref().map(|f| f.pending.is_some()).unwrap_or(false)
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Snapshot lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotStatus {
    Creating,
    Available,
    Deleting,
    Error,
    Deleted,
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotStatus::Creating => write!(f, "creating"),
            SnapshotStatus::Available => write!(f, "available"),
            SnapshotStatus::Deleting => write!(f, "deleting"),
            SnapshotStatus::Error => write!(f, "error"),
            SnapshotStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Snapshot driver call whose remote outcome is unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPending {
    Create,
    Delete,
}

/// Point-in-time copy of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub backend: String,
    pub size_gb: u64,
    pub status: SnapshotStatus,
    pub consumption_ratio: f64,
    pub provider: Option<SnapshotHandle>,
    /// Probe needed: a driver call timed out with unknown outcome
    pub pending: Option<SnapshotPending>,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Counts as a dependent of its parent volume
    pub fn is_live(&self) -> bool {
        self.status != SnapshotStatus::Deleted
    }
}

// =============================================================================
// Replication Pair
// =============================================================================

/// How writes reach the secondary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Sync,
    Async,
}

impl std::str::FromStr for ReplicationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sync" | "synchronous" => Ok(ReplicationMode::Sync),
            "async" | "asynchronous" | "periodic" => Ok(ReplicationMode::Async),
            other => Err(format!("unknown replication mode: {}", other)),
        }
    }
}

/// Which side of a pair serves I/O
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveSide {
    Primary,
    Secondary(String),
}

/// Association between a primary backend and its replication target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPair {
    /// Primary backend name; at most one pair per backend
    pub primary: String,
    /// Secondary target `backend_id`
    pub secondary: String,
    pub mode: ReplicationMode,
    pub rpo: Duration,
    pub active_side: ActiveSide,
}

impl ReplicationPair {
    /// Effective backend id for volumes bound to this pair
    pub fn active_backend_id(&self) -> Option<&str> {
        match &self.active_side {
            ActiveSide::Primary => None,
            ActiveSide::Secondary(id) => Some(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_is_true() {
        assert!(spec_is_true("<is> True"));
        assert!(spec_is_true("true"));
        assert!(spec_is_true("  <is>   TRUE"));
        assert!(!spec_is_true("<is> False"));
        assert!(!spec_is_true("yes"));
    }

    #[test]
    fn test_volume_type_flags() {
        let vt = VolumeType::new("replicated")
            .with_spec(REPLICATION_SPEC, "<is> True")
            .with_spec(MULTIATTACH_SPEC, "<is> False");
        assert!(vt.wants_replication());
        assert!(!vt.allows_multiattach());
    }

    #[test]
    fn test_replication_mode_parse() {
        assert_eq!("sync".parse::<ReplicationMode>().unwrap(), ReplicationMode::Sync);
        assert_eq!("Async".parse::<ReplicationMode>().unwrap(), ReplicationMode::Async);
        assert!("eventual".parse::<ReplicationMode>().is_err());
    }
}
