//! Domain Ports - The volume driver contract
//!
//! Every storage array is represented by an implementation of
//! [`VolumeDriver`]. The rest of the core only ever talks to arrays through
//! this trait, so nothing above it assumes a transport.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Protocols
// =============================================================================

/// Data-path protocol a backend exports volumes over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Iscsi,
    FibreChannel,
    NvmeOf,
    Nfs,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Iscsi => write!(f, "iSCSI"),
            Protocol::FibreChannel => write!(f, "FC"),
            Protocol::NvmeOf => write!(f, "NVMe-oF"),
            Protocol::Nfs => write!(f, "NFS"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "iscsi" => Ok(Protocol::Iscsi),
            "fc" | "fibre_channel" | "fibrechannel" => Ok(Protocol::FibreChannel),
            "nvmeof" | "nvme-of" | "nvme_tcp" | "nvme" => Ok(Protocol::NvmeOf),
            "nfs" => Ok(Protocol::Nfs),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

// =============================================================================
// Capability Report
// =============================================================================

/// Immutable snapshot of a backend's capacity and feature flags.
///
/// Reports are shared as `Arc<CapabilityReport>` and replaced whole on
/// refresh; readers never see a half-updated report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub backend_name: String,
    pub vendor_name: String,
    pub driver_version: String,
    pub storage_protocol: Protocol,
    pub pool_name: Option<String>,
    pub total_capacity_gb: f64,
    pub free_capacity_gb: f64,
    /// Sum of sizes of all provisioned volumes (thin or thick)
    pub provisioned_capacity_gb: f64,
    pub reserved_percentage: u32,
    pub max_over_subscription_ratio: f64,
    pub thin_provisioning_support: bool,
    pub thick_provisioning_support: bool,
    pub compression_support: bool,
    pub qos_support: bool,
    pub multiattach: bool,
    pub replication_enabled: bool,
    pub replication_targets: Vec<String>,
    pub supports_extend_with_snapshots: bool,
    pub total_volumes: u64,
    /// Vendor-specific capabilities, matched by `capabilities:<key>` extra-specs
    pub extra: BTreeMap<String, String>,
    pub reported_at: DateTime<Utc>,
}

impl CapabilityReport {
    /// Free space left after the reserved percentage is withheld
    pub fn usable_free_gb(&self) -> f64 {
        let reserved = self.total_capacity_gb * f64::from(self.reserved_percentage) / 100.0;
        (self.free_capacity_gb - reserved).max(0.0)
    }

    /// Look up a capability by extra-spec key, rendered as a string.
    ///
    /// Booleans render as `True`/`False` to match volume-type conventions.
    pub fn capability(&self, key: &str) -> Option<String> {
        let flag = |b: bool| Some(if b { "True" } else { "False" }.to_string());
        match key {
            "thin_provisioning_support" => flag(self.thin_provisioning_support),
            "thick_provisioning_support" => flag(self.thick_provisioning_support),
            "compression_support" => flag(self.compression_support),
            "qos_support" => flag(self.qos_support),
            "multiattach" => flag(self.multiattach),
            "replication_enabled" => flag(self.replication_enabled),
            "supports_extend_with_snapshots" => flag(self.supports_extend_with_snapshots),
            "storage_protocol" => Some(self.storage_protocol.to_string()),
            "vendor_name" => Some(self.vendor_name.clone()),
            "driver_version" => Some(self.driver_version.clone()),
            "pool_name" => self.pool_name.clone(),
            "volume_backend_name" => Some(self.backend_name.clone()),
            "total_capacity_gb" => Some(self.total_capacity_gb.to_string()),
            "free_capacity_gb" => Some(self.free_capacity_gb.to_string()),
            "reserved_percentage" => Some(self.reserved_percentage.to_string()),
            "max_over_subscription_ratio" => Some(self.max_over_subscription_ratio.to_string()),
            "total_volumes" => Some(self.total_volumes.to_string()),
            other => self.extra.get(other).cloned(),
        }
    }
}

// =============================================================================
// Connection Info
// =============================================================================

/// Protocol-specific addressing data handed back to the attach caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver_volume_type", rename_all = "snake_case")]
pub enum ConnectionInfo {
    Iscsi {
        target_iqn: String,
        target_portals: Vec<String>,
        target_lun: u32,
        auth_method: Option<String>,
        multipath: bool,
    },
    FibreChannel {
        target_wwns: Vec<String>,
        target_lun: u32,
        initiator_target_map: BTreeMap<String, Vec<String>>,
    },
    Nvmeof {
        target_nqn: String,
        target_portals: Vec<String>,
        namespace_id: u32,
    },
    Nfs {
        export: String,
        mount_options: Option<String>,
    },
}

impl ConnectionInfo {
    pub fn protocol(&self) -> Protocol {
        match self {
            ConnectionInfo::Iscsi { .. } => Protocol::Iscsi,
            ConnectionInfo::FibreChannel { .. } => Protocol::FibreChannel,
            ConnectionInfo::Nvmeof { .. } => Protocol::NvmeOf,
            ConnectionInfo::Nfs { .. } => Protocol::Nfs,
        }
    }
}

/// Consumer host requesting a data path to a volume
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostDescriptor {
    /// Host name, unique per consumer
    pub host: String,
    pub ip: Option<String>,
    pub initiator_iqn: Option<String>,
    pub wwpns: Vec<String>,
    pub nqn: Option<String>,
    pub multipath: bool,
}

impl HostDescriptor {
    /// Host with an iSCSI initiator
    pub fn iscsi(host: impl Into<String>, initiator_iqn: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ip: None,
            initiator_iqn: Some(initiator_iqn.into()),
            wwpns: Vec::new(),
            nqn: None,
            multipath: false,
        }
    }

    /// Host with FC initiator ports
    pub fn fibre_channel(host: impl Into<String>, wwpns: Vec<String>) -> Self {
        Self {
            host: host.into(),
            ip: None,
            initiator_iqn: None,
            wwpns,
            nqn: None,
            multipath: false,
        }
    }

    /// Check the host has the initiator identity a protocol needs
    pub fn validate_for(&self, protocol: Protocol) -> Result<()> {
        let ok = match protocol {
            Protocol::Iscsi => self.initiator_iqn.is_some(),
            Protocol::FibreChannel => !self.wwpns.is_empty(),
            Protocol::NvmeOf => self.nqn.is_some(),
            Protocol::Nfs => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidRequest(format!(
                "host {} has no {} initiator",
                self.host, protocol
            )))
        }
    }
}

// =============================================================================
// Driver Requests / Handles
// =============================================================================

/// Everything a driver needs to create a volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub volume_id: String,
    pub name: String,
    pub size_gb: u64,
    pub thin: bool,
    /// Passed opaquely; drivers pick out vendor keys (e.g. `qos:maxIOPS`)
    pub extra_specs: BTreeMap<String, String>,
}

/// Driver-side identity of a volume
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeHandle {
    pub provider_id: String,
    pub provider_location: Option<String>,
}

/// Driver-side identity of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub provider_id: String,
    pub volume_provider_id: String,
    pub size_gb: u64,
    /// Fraction of the parent's space consumed by the snapshot
    pub consumption_ratio: f64,
}

/// Result of a volume existence probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub provider_id: String,
    pub size_gb: u64,
    pub exported_to: Vec<String>,
}

/// Where a failover should land
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailoverTarget {
    /// A configured replication target, by `backend_id`
    Secondary(String),
    /// Back to the primary array
    Default,
}

impl std::fmt::Display for FailoverTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverTarget::Secondary(id) => write!(f, "{}", id),
            FailoverTarget::Default => write!(f, "default"),
        }
    }
}

impl From<&str> for FailoverTarget {
    fn from(s: &str) -> Self {
        if s == "default" {
            FailoverTarget::Default
        } else {
            FailoverTarget::Secondary(s.to_string())
        }
    }
}

/// Replication health as reported by the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub sync_incomplete: bool,
    pub lag_secs: u64,
    pub active_target: FailoverTarget,
}

// =============================================================================
// Volume Driver Port
// =============================================================================

/// Contract every backend implements.
///
/// Side effects stay on the backing array; a driver never touches another
/// backend. All failures are typed [`Error`] variants.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Create an empty volume
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeHandle>;

    /// Delete a volume. `NotFound` is normalized to success by the caller.
    async fn delete_volume(&self, handle: &VolumeHandle) -> Result<()>;

    /// Take a point-in-time snapshot
    async fn create_snapshot(
        &self,
        handle: &VolumeHandle,
        snapshot_id: &str,
    ) -> Result<SnapshotHandle>;

    /// Delete a snapshot
    async fn delete_snapshot(&self, snapshot: &SnapshotHandle) -> Result<()>;

    /// Create a volume whose content equals the snapshot
    async fn create_from_snapshot(
        &self,
        snapshot: &SnapshotHandle,
        spec: &VolumeSpec,
    ) -> Result<VolumeHandle>;

    /// Create a volume whose content equals the source at clone time
    async fn clone_volume(&self, source: &VolumeHandle, spec: &VolumeSpec)
        -> Result<VolumeHandle>;

    /// Grow a volume
    async fn extend(&self, handle: &VolumeHandle, new_size_gb: u64) -> Result<()>;

    /// Export a volume to a host
    async fn attach(&self, handle: &VolumeHandle, host: &HostDescriptor)
        -> Result<ConnectionInfo>;

    /// Remove a host's export. Unmapped hosts are a no-op success.
    async fn detach(&self, handle: &VolumeHandle, host: &HostDescriptor) -> Result<()>;

    /// Report capacity and features
    async fn get_capabilities(&self) -> Result<CapabilityReport>;

    /// Switch the array's active side
    async fn failover(&self, target: &FailoverTarget) -> Result<()>;

    /// Report replication sync state
    async fn replication_status(&self) -> Result<ReplicationStatus>;

    /// Probe a volume; `None` if the array has no such volume
    async fn query_volume(&self, handle: &VolumeHandle) -> Result<Option<VolumeInfo>>;

    /// Probe a snapshot; `false` if the array has no such snapshot
    async fn query_snapshot(&self, snapshot: &SnapshotHandle) -> Result<bool>;

    /// Protocol volumes are exported over
    fn protocol(&self) -> Protocol;

    /// Short driver name, used in logs and status
    fn driver_name(&self) -> &str;
}

pub type VolumeDriverRef = Arc<dyn VolumeDriver>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("iSCSI".parse::<Protocol>().unwrap(), Protocol::Iscsi);
        assert_eq!("fc".parse::<Protocol>().unwrap(), Protocol::FibreChannel);
        assert_eq!("nvmeof".parse::<Protocol>().unwrap(), Protocol::NvmeOf);
        assert!("smb".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_connection_info_tagging() {
        let info = ConnectionInfo::Iscsi {
            target_iqn: "iqn.2010-10.org.openstack:volume-1".into(),
            target_portals: vec!["10.0.1.10:3260".into()],
            target_lun: 1,
            auth_method: None,
            multipath: false,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["driver_volume_type"], "iscsi");
        assert_eq!(info.protocol(), Protocol::Iscsi);
    }

    #[test]
    fn test_host_validation() {
        let host = HostDescriptor::iscsi("compute-1", "iqn.1994-05.com.redhat:c1");
        assert!(host.validate_for(Protocol::Iscsi).is_ok());
        assert!(host.validate_for(Protocol::FibreChannel).is_err());
        assert!(host.validate_for(Protocol::Nfs).is_ok());
    }

    #[test]
    fn test_failover_target_from_str() {
        assert_eq!(FailoverTarget::from("default"), FailoverTarget::Default);
        assert_eq!(
            FailoverTarget::from("replica-1"),
            FailoverTarget::Secondary("replica-1".into())
        );
    }
}
