//! In-Memory Array Driver
//!
//! Simulates a SAN array entirely in process memory: pools with thin or
//! thick provisioning, LUN exports, snapshots and a replication target.
//! Volume content is kept as [`Bytes`] so snapshots and clones share the
//! parent's buffer until written.
//!
//! The driver also carries fault injection hooks, used by tests and by
//! staging deployments to rehearse failure handling.

use crate::controlplane::config::{BackendSection, ReplicationDevice};
use crate::domain::ports::{
    CapabilityReport, ConnectionInfo, FailoverTarget, HostDescriptor, Protocol,
    ReplicationStatus, SnapshotHandle, VolumeDriver, VolumeHandle, VolumeInfo, VolumeSpec,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info};

const GIB: u64 = 1024 * 1024 * 1024;
const DRIVER_VERSION: &str = "1.4.0";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the in-memory array
#[derive(Debug, Clone)]
pub struct MemoryDriverConfig {
    pub backend_name: String,
    pub vendor_name: String,
    pub pool_name: String,
    pub san_ip: String,
    pub total_capacity_gb: u64,
    pub thin_provisioning: bool,
    pub max_over_subscription_ratio: f64,
    pub reserved_percentage: u32,
    pub protocol: Protocol,
    pub target_portals: Vec<String>,
    pub target_wwns: Vec<String>,
    /// Exports across all volumes
    pub max_exports: u32,
    pub max_snapshots_per_volume: u32,
    pub supports_extend_with_snapshots: bool,
    pub compression_support: bool,
    pub qos_support: bool,
    pub multiattach: bool,
    pub replication: Option<ReplicationDevice>,
    /// Vendor capabilities reported verbatim
    pub extra_capabilities: BTreeMap<String, String>,
}

impl Default for MemoryDriverConfig {
    fn default() -> Self {
        Self {
            backend_name: "memory".to_string(),
            vendor_name: "Simulated".to_string(),
            pool_name: "pool-0".to_string(),
            san_ip: "127.0.0.1".to_string(),
            total_capacity_gb: 1024,
            thin_provisioning: true,
            max_over_subscription_ratio: 20.0,
            reserved_percentage: 0,
            protocol: Protocol::Iscsi,
            target_portals: vec!["127.0.0.1:3260".to_string()],
            target_wwns: Vec::new(),
            max_exports: 256,
            max_snapshots_per_volume: 32,
            supports_extend_with_snapshots: true,
            compression_support: false,
            qos_support: false,
            multiattach: true,
            replication: None,
            extra_capabilities: BTreeMap::new(),
        }
    }
}

impl MemoryDriverConfig {
    /// Build from a backend section, validating every option
    pub fn from_section(section: &BackendSection) -> Result<Self> {
        let defaults = Self::default();

        // Credentials are required even though nothing is dialed
        let san_ip = section.require("san_ip")?.to_string();
        section.require("san_login")?;
        section.require("san_password")?;

        let protocol = section.protocol()?.unwrap_or(Protocol::Iscsi);
        if protocol == Protocol::Nfs {
            return Err(Error::invalid_config(
                &section.name,
                "memory driver exports block protocols only",
            ));
        }

        let total_capacity_gb = section.get_u64("total_capacity_gb", defaults.total_capacity_gb)?;
        if total_capacity_gb == 0 {
            return Err(Error::invalid_config(&section.name, "total_capacity_gb must be > 0"));
        }

        let max_over_subscription_ratio = section.get_f64(
            "max_over_subscription_ratio",
            defaults.max_over_subscription_ratio,
        )?;
        if max_over_subscription_ratio < 1.0 {
            return Err(Error::invalid_config(
                &section.name,
                "max_over_subscription_ratio must be >= 1.0",
            ));
        }

        let reserved_percentage = section.get_u32("reserved_percentage", 0)?;
        if reserved_percentage > 100 {
            return Err(Error::invalid_config(
                &section.name,
                "reserved_percentage must be within 0..=100",
            ));
        }

        let mut target_portals = section.get_list("target_portals");
        if target_portals.is_empty() {
            let ip = section.get("target_ip_address").unwrap_or(&san_ip).to_string();
            let port = section.get_u32("target_port", 3260)?;
            target_portals.push(format!("{}:{}", ip, port));
        }

        let target_wwns = section.get_list("target_wwns");
        if protocol == Protocol::FibreChannel && target_wwns.is_empty() {
            return Err(Error::invalid_config(
                &section.name,
                "target_wwns is required for FC",
            ));
        }

        let extra_capabilities = section
            .get_list("extra_capabilities")
            .into_iter()
            .filter_map(|kv| {
                kv.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect();

        Ok(Self {
            backend_name: section.backend_name(),
            vendor_name: section
                .get("vendor_name")
                .unwrap_or(&defaults.vendor_name)
                .to_string(),
            pool_name: section.get("pool_name").unwrap_or(&defaults.pool_name).to_string(),
            san_ip,
            total_capacity_gb,
            thin_provisioning: section.get_bool("san_thin_provision", true)?,
            max_over_subscription_ratio,
            reserved_percentage,
            protocol,
            target_portals,
            target_wwns,
            max_exports: section.get_u32("max_exports", defaults.max_exports)?,
            max_snapshots_per_volume: section
                .get_u32("max_snapshots_per_volume", defaults.max_snapshots_per_volume)?,
            supports_extend_with_snapshots: section
                .get_bool("supports_extend_with_snapshots", true)?,
            compression_support: section.get_bool("compression_support", false)?,
            qos_support: section.get_bool("qos_support", false)?,
            multiattach: section.get_bool("multiattach", true)?,
            replication: section.replication_device()?,
            extra_capabilities,
        })
    }
}

// =============================================================================
// Fault Injection
// =============================================================================

/// Driver entry points, for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    Create,
    Delete,
    Snapshot,
    DeleteSnapshot,
    CreateFromSnapshot,
    Clone,
    Extend,
    Attach,
    Detach,
    Capabilities,
    Failover,
    ReplicationStatus,
    Query,
}

/// A scripted failure for the next call of one op
#[derive(Debug, Clone, PartialEq)]
pub enum InjectedFault {
    /// Definitive `BackendUnavailable`
    Unavailable,
    /// Definitive `BackendOperationFailed`
    Failed(String),
    /// Never answer; nothing is applied
    Hang,
    /// Apply the change, then never answer
    ApplyThenHang,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    scripted: HashMap<DriverOp, VecDeque<InjectedFault>>,
    latency: HashMap<DriverOp, Duration>,
    calls: HashMap<DriverOp, u64>,
}

// =============================================================================
// Array State
// =============================================================================

#[derive(Debug, Clone)]
struct SimVolume {
    size_gb: u64,
    thin: bool,
    content: Bytes,
    /// host -> LUN
    exports: BTreeMap<String, u32>,
    snapshots: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct SimSnapshot {
    volume_id: String,
    size_gb: u64,
    content: Bytes,
}

#[derive(Debug)]
struct ArrayState {
    volumes: HashMap<String, SimVolume>,
    snapshots: HashMap<String, SimSnapshot>,
    active: FailoverTarget,
    sync_incomplete: bool,
    lag_secs: u64,
    next_lun: u32,
}

impl ArrayState {
    fn export_count(&self) -> usize {
        self.volumes.values().map(|v| v.exports.len()).sum()
    }

    fn provisioned_gb(&self) -> u64 {
        self.volumes.values().map(|v| v.size_gb).sum()
    }

    /// Physical consumption: thick volumes reserve their full size
    fn used_gb(&self) -> f64 {
        self.volumes
            .values()
            .map(|v| {
                if v.thin {
                    v.content.len() as f64 / GIB as f64
                } else {
                    v.size_gb as f64
                }
            })
            .sum()
    }
}

// =============================================================================
// Memory Driver
// =============================================================================

/// Simulated block array
#[derive(Debug)]
pub struct MemoryDriver {
    config: MemoryDriverConfig,
    state: Mutex<ArrayState>,
    faults: Mutex<Faults>,
}

impl MemoryDriver {
    pub fn new(config: MemoryDriverConfig) -> Self {
        info!(
            "Initialized memory array {} ({} GiB, {})",
            config.backend_name, config.total_capacity_gb, config.protocol
        );
        Self {
            config,
            state: Mutex::new(ArrayState {
                volumes: HashMap::new(),
                snapshots: HashMap::new(),
                active: FailoverTarget::Default,
                sync_incomplete: false,
                lag_secs: 0,
                next_lun: 1,
            }),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Thin iSCSI array with default limits
    pub fn for_tests(backend_name: &str, total_capacity_gb: u64) -> Self {
        Self::new(MemoryDriverConfig {
            backend_name: backend_name.to_string(),
            total_capacity_gb,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &MemoryDriverConfig {
        &self.config
    }

    // =========================================================================
    // Fault injection and inspection
    // =========================================================================

    /// Every call fails with `BackendUnavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    /// Queue a fault for the next call of `op`
    pub fn inject(&self, op: DriverOp, fault: InjectedFault) {
        self.faults.lock().scripted.entry(op).or_default().push_back(fault);
    }

    /// Delay every call of `op`
    pub fn set_latency(&self, op: DriverOp, latency: Duration) {
        self.faults.lock().latency.insert(op, latency);
    }

    /// Number of calls received for `op`
    pub fn calls(&self, op: DriverOp) -> u64 {
        self.faults.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn set_sync_incomplete(&self, incomplete: bool) {
        self.state.lock().sync_incomplete = incomplete;
    }

    pub fn set_replication_lag(&self, lag_secs: u64) {
        self.state.lock().lag_secs = lag_secs;
    }

    pub fn active_target(&self) -> FailoverTarget {
        self.state.lock().active.clone()
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().volumes.len()
    }

    pub fn has_volume(&self, provider_id: &str) -> bool {
        self.state.lock().volumes.contains_key(provider_id)
    }

    /// Write `data` at `offset` bytes into a volume
    pub fn write(&self, handle: &VolumeHandle, offset: usize, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let volume = state
            .volumes
            .get_mut(&handle.provider_id)
            .ok_or_else(|| Error::not_found("volume", &handle.provider_id))?;

        let end = offset + data.len();
        if end as u64 > volume.size_gb * GIB {
            return Err(Error::InvalidRequest(format!(
                "write past end of {} GiB volume",
                volume.size_gb
            )));
        }

        let mut buf = BytesMut::with_capacity(end.max(volume.content.len()));
        buf.extend_from_slice(&volume.content);
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        volume.content = buf.freeze();
        Ok(())
    }

    /// Written content of a volume
    pub fn read(&self, handle: &VolumeHandle) -> Result<Bytes> {
        self.state
            .lock()
            .volumes
            .get(&handle.provider_id)
            .map(|v| v.content.clone())
            .ok_or_else(|| Error::not_found("volume", &handle.provider_id))
    }

    /// Content captured by a snapshot
    pub fn read_snapshot(&self, snapshot: &SnapshotHandle) -> Result<Bytes> {
        self.state
            .lock()
            .snapshots
            .get(&snapshot.provider_id)
            .map(|s| s.content.clone())
            .ok_or_else(|| Error::not_found("snapshot", &snapshot.provider_id))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Count the call, apply latency and scripted faults.
    ///
    /// Returns `true` when the call must hang after applying its effect.
    async fn enter(&self, op: DriverOp) -> Result<bool> {
        let latency = {
            let mut faults = self.faults.lock();
            *faults.calls.entry(op).or_insert(0) += 1;
            faults.latency.get(&op).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let fault = {
            let mut faults = self.faults.lock();
            if faults.unavailable {
                return Err(self.unavailable("array not responding"));
            }
            faults.scripted.get_mut(&op).and_then(VecDeque::pop_front)
        };

        match fault {
            None => Ok(false),
            Some(InjectedFault::Unavailable) => Err(self.unavailable("injected fault")),
            Some(InjectedFault::Failed(reason)) => Err(Error::BackendOperationFailed {
                backend: self.config.backend_name.clone(),
                operation: format!("{:?}", op),
                reason,
            }),
            Some(InjectedFault::Hang) => {
                futures::future::pending::<()>().await;
                Ok(false)
            }
            Some(InjectedFault::ApplyThenHang) => Ok(true),
        }
    }

    async fn leave<T>(&self, hang: bool, value: T) -> Result<T> {
        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(value)
    }

    fn unavailable(&self, reason: &str) -> Error {
        Error::BackendUnavailable {
            backend: self.config.backend_name.clone(),
            reason: reason.to_string(),
        }
    }

    fn insufficient(&self, requested_gb: u64, available_gb: f64) -> Error {
        Error::InsufficientCapacity {
            backend: self.config.backend_name.clone(),
            requested_gb,
            available_gb,
        }
    }

    fn replication_target(&self) -> Result<&ReplicationDevice> {
        self.config
            .replication
            .as_ref()
            .ok_or_else(|| Error::ReplicationNotConfigured {
                backend: self.config.backend_name.clone(),
            })
    }

    /// Check the pool can hold a new volume of `size_gb`
    fn check_capacity(&self, state: &ArrayState, size_gb: u64, thin: bool) -> Result<()> {
        let total = self.config.total_capacity_gb as f64;
        if thin {
            let limit = total * self.config.max_over_subscription_ratio;
            let provisioned = state.provisioned_gb() as f64;
            if provisioned + size_gb as f64 > limit {
                return Err(self.insufficient(size_gb, (limit - provisioned).max(0.0)));
            }
        } else {
            let free = total - state.used_gb();
            if size_gb as f64 > free {
                return Err(self.insufficient(size_gb, free.max(0.0)));
            }
        }
        Ok(())
    }

    fn insert_volume(
        &self,
        state: &mut ArrayState,
        spec: &VolumeSpec,
        content: Bytes,
    ) -> Result<VolumeHandle> {
        if spec.size_gb == 0 {
            return Err(Error::InvalidRequest("volume size must be > 0".into()));
        }
        if state.volumes.contains_key(&spec.volume_id) {
            return Err(Error::BackendOperationFailed {
                backend: self.config.backend_name.clone(),
                operation: "create_volume".into(),
                reason: format!("volume {} already exists", spec.volume_id),
            });
        }
        let thin = spec.thin && self.config.thin_provisioning;
        self.check_capacity(state, spec.size_gb, thin)?;

        state.volumes.insert(
            spec.volume_id.clone(),
            SimVolume {
                size_gb: spec.size_gb,
                thin,
                content,
                exports: BTreeMap::new(),
                snapshots: BTreeSet::new(),
            },
        );
        debug!(
            "Created memory volume {} ({} GiB, thin={})",
            spec.volume_id, spec.size_gb, thin
        );
        Ok(self.handle(&state.active, &spec.volume_id))
    }

    fn handle(&self, active: &FailoverTarget, provider_id: &str) -> VolumeHandle {
        let site = match active {
            FailoverTarget::Default => self.config.san_ip.as_str(),
            FailoverTarget::Secondary(_) => self
                .config
                .replication
                .as_ref()
                .map(|r| r.san_ip.as_str())
                .unwrap_or(self.config.san_ip.as_str()),
        };
        VolumeHandle {
            provider_id: provider_id.to_string(),
            provider_location: Some(format!("{}:{}/{}", site, self.config.pool_name, provider_id)),
        }
    }

    fn connection_info(
        &self,
        active: &FailoverTarget,
        provider_id: &str,
        host: &HostDescriptor,
        lun: u32,
    ) -> ConnectionInfo {
        let portals = match (active, &self.config.replication) {
            (FailoverTarget::Secondary(_), Some(replica)) => vec![format!("{}:3260", replica.san_ip)],
            _ => self.config.target_portals.clone(),
        };
        match self.config.protocol {
            Protocol::Iscsi => ConnectionInfo::Iscsi {
                target_iqn: format!(
                    "iqn.2010-10.org.openstack:{}-volume-{}",
                    self.config.pool_name, provider_id
                ),
                target_portals: portals,
                target_lun: lun,
                auth_method: Some("CHAP".to_string()),
                multipath: host.multipath,
            },
            Protocol::FibreChannel => {
                let initiator_target_map = host
                    .wwpns
                    .iter()
                    .map(|wwpn| (wwpn.clone(), self.config.target_wwns.clone()))
                    .collect();
                ConnectionInfo::FibreChannel {
                    target_wwns: self.config.target_wwns.clone(),
                    target_lun: lun,
                    initiator_target_map,
                }
            }
            Protocol::NvmeOf => ConnectionInfo::Nvmeof {
                target_nqn: format!(
                    "nqn.2014-08.org.nvmexpress:{}:{}",
                    self.config.pool_name, provider_id
                ),
                target_portals: portals,
                namespace_id: lun,
            },
            Protocol::Nfs => ConnectionInfo::Nfs {
                export: format!("{}:/{}", self.config.san_ip, provider_id),
                mount_options: None,
            },
        }
    }
}

#[async_trait]
impl VolumeDriver for MemoryDriver {
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeHandle> {
        let hang = self.enter(DriverOp::Create).await?;
        let handle = {
            let mut state = self.state.lock();
            self.insert_volume(&mut state, spec, Bytes::new())?
        };
        self.leave(hang, handle).await
    }

    async fn delete_volume(&self, handle: &VolumeHandle) -> Result<()> {
        let hang = self.enter(DriverOp::Delete).await?;
        {
            let mut state = self.state.lock();
            let volume = state
                .volumes
                .get(&handle.provider_id)
                .ok_or_else(|| Error::not_found("volume", &handle.provider_id))?;
            if !volume.snapshots.is_empty() {
                return Err(Error::InUse {
                    kind: "volume".into(),
                    id: handle.provider_id.clone(),
                    reason: format!("{} snapshots on array", volume.snapshots.len()),
                });
            }
            if !volume.exports.is_empty() {
                return Err(Error::InUse {
                    kind: "volume".into(),
                    id: handle.provider_id.clone(),
                    reason: "still exported".into(),
                });
            }
            state.volumes.remove(&handle.provider_id);
            debug!("Deleted memory volume {}", handle.provider_id);
        }
        self.leave(hang, ()).await
    }

    async fn create_snapshot(
        &self,
        handle: &VolumeHandle,
        snapshot_id: &str,
    ) -> Result<SnapshotHandle> {
        let hang = self.enter(DriverOp::Snapshot).await?;
        let snapshot = {
            let mut state = self.state.lock();
            let volume = state
                .volumes
                .get_mut(&handle.provider_id)
                .ok_or_else(|| Error::not_found("volume", &handle.provider_id))?;
            if volume.snapshots.len() as u32 >= self.config.max_snapshots_per_volume {
                return Err(Error::QuotaExceeded {
                    resource: "snapshots".into(),
                    reason: format!(
                        "volume {} already has {} snapshots",
                        handle.provider_id, self.config.max_snapshots_per_volume
                    ),
                });
            }
            volume.snapshots.insert(snapshot_id.to_string());
            let content = volume.content.clone();
            let size_gb = volume.size_gb;
            let consumption_ratio = content.len() as f64 / (size_gb * GIB) as f64;

            state.snapshots.insert(
                snapshot_id.to_string(),
                SimSnapshot {
                    volume_id: handle.provider_id.clone(),
                    size_gb,
                    content,
                },
            );
            SnapshotHandle {
                provider_id: snapshot_id.to_string(),
                volume_provider_id: handle.provider_id.clone(),
                size_gb,
                consumption_ratio,
            }
        };
        self.leave(hang, snapshot).await
    }

    async fn delete_snapshot(&self, snapshot: &SnapshotHandle) -> Result<()> {
        let hang = self.enter(DriverOp::DeleteSnapshot).await?;
        {
            let mut state = self.state.lock();
            let removed = state
                .snapshots
                .remove(&snapshot.provider_id)
                .ok_or_else(|| Error::not_found("snapshot", &snapshot.provider_id))?;
            if let Some(parent) = state.volumes.get_mut(&removed.volume_id) {
                parent.snapshots.remove(&snapshot.provider_id);
            }
        }
        self.leave(hang, ()).await
    }

    async fn create_from_snapshot(
        &self,
        snapshot: &SnapshotHandle,
        spec: &VolumeSpec,
    ) -> Result<VolumeHandle> {
        let hang = self.enter(DriverOp::CreateFromSnapshot).await?;
        let handle = {
            let mut state = self.state.lock();
            let source = state
                .snapshots
                .get(&snapshot.provider_id)
                .cloned()
                .ok_or_else(|| Error::not_found("snapshot", &snapshot.provider_id))?;
            if spec.size_gb < source.size_gb {
                return Err(Error::InvalidRequest(format!(
                    "volume size {} GiB smaller than snapshot {} GiB",
                    spec.size_gb, source.size_gb
                )));
            }
            self.insert_volume(&mut state, spec, source.content)?
        };
        self.leave(hang, handle).await
    }

    async fn clone_volume(
        &self,
        source: &VolumeHandle,
        spec: &VolumeSpec,
    ) -> Result<VolumeHandle> {
        let hang = self.enter(DriverOp::Clone).await?;
        let handle = {
            let mut state = self.state.lock();
            let parent = state
                .volumes
                .get(&source.provider_id)
                .ok_or_else(|| Error::not_found("volume", &source.provider_id))?;
            if spec.size_gb < parent.size_gb {
                return Err(Error::InvalidRequest(format!(
                    "clone size {} GiB smaller than source {} GiB",
                    spec.size_gb, parent.size_gb
                )));
            }
            let content = parent.content.clone();
            self.insert_volume(&mut state, spec, content)?
        };
        self.leave(hang, handle).await
    }

    async fn extend(&self, handle: &VolumeHandle, new_size_gb: u64) -> Result<()> {
        let hang = self.enter(DriverOp::Extend).await?;
        {
            let mut state = self.state.lock();
            let (size_gb, thin, has_snapshots) = state
                .volumes
                .get(&handle.provider_id)
                .map(|v| (v.size_gb, v.thin, !v.snapshots.is_empty()))
                .ok_or_else(|| Error::not_found("volume", &handle.provider_id))?;

            if new_size_gb <= size_gb {
                return Err(Error::InvalidRequest(format!(
                    "new size {} GiB must exceed current {} GiB",
                    new_size_gb, size_gb
                )));
            }
            if has_snapshots && !self.config.supports_extend_with_snapshots {
                return Err(Error::HasSnapshots {
                    volume_id: handle.provider_id.clone(),
                });
            }
            self.check_capacity(&state, new_size_gb - size_gb, thin)?;

            if let Some(volume) = state.volumes.get_mut(&handle.provider_id) {
                volume.size_gb = new_size_gb;
            }
        }
        self.leave(hang, ()).await
    }

    async fn attach(
        &self,
        handle: &VolumeHandle,
        host: &HostDescriptor,
    ) -> Result<ConnectionInfo> {
        let hang = self.enter(DriverOp::Attach).await?;
        host.validate_for(self.config.protocol)?;

        let info = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let exports = state.export_count();
            let next_lun = state.next_lun;
            let active = state.active.clone();

            let volume = state
                .volumes
                .get_mut(&handle.provider_id)
                .ok_or_else(|| Error::not_found("volume", &handle.provider_id))?;

            let lun = match volume.exports.get(&host.host) {
                Some(lun) => *lun,
                None => {
                    if exports as u32 >= self.config.max_exports {
                        return Err(Error::ExportLimitExceeded {
                            backend: self.config.backend_name.clone(),
                            limit: self.config.max_exports,
                        });
                    }
                    volume.exports.insert(host.host.clone(), next_lun);
                    state.next_lun += 1;
                    next_lun
                }
            };
            self.connection_info(&active, &handle.provider_id, host, lun)
        };
        self.leave(hang, info).await
    }

    async fn detach(&self, handle: &VolumeHandle, host: &HostDescriptor) -> Result<()> {
        let hang = self.enter(DriverOp::Detach).await?;
        {
            let mut state = self.state.lock();
            let volume = state
                .volumes
                .get_mut(&handle.provider_id)
                .ok_or_else(|| Error::not_found("volume", &handle.provider_id))?;
            volume.exports.remove(&host.host);
        }
        self.leave(hang, ()).await
    }

    async fn get_capabilities(&self) -> Result<CapabilityReport> {
        self.enter(DriverOp::Capabilities).await?;
        let state = self.state.lock();
        let total = self.config.total_capacity_gb as f64;

        Ok(CapabilityReport {
            backend_name: self.config.backend_name.clone(),
            vendor_name: self.config.vendor_name.clone(),
            driver_version: DRIVER_VERSION.to_string(),
            storage_protocol: self.config.protocol,
            pool_name: Some(self.config.pool_name.clone()),
            total_capacity_gb: total,
            free_capacity_gb: (total - state.used_gb()).max(0.0),
            provisioned_capacity_gb: state.provisioned_gb() as f64,
            reserved_percentage: self.config.reserved_percentage,
            max_over_subscription_ratio: if self.config.thin_provisioning {
                self.config.max_over_subscription_ratio
            } else {
                1.0
            },
            thin_provisioning_support: self.config.thin_provisioning,
            thick_provisioning_support: true,
            compression_support: self.config.compression_support,
            qos_support: self.config.qos_support,
            multiattach: self.config.multiattach,
            replication_enabled: self.config.replication.is_some(),
            replication_targets: self
                .config
                .replication
                .iter()
                .map(|r| r.backend_id.clone())
                .collect(),
            supports_extend_with_snapshots: self.config.supports_extend_with_snapshots,
            total_volumes: state.volumes.len() as u64,
            extra: self.config.extra_capabilities.clone(),
            reported_at: chrono::Utc::now(),
        })
    }

    async fn failover(&self, target: &FailoverTarget) -> Result<()> {
        let hang = self.enter(DriverOp::Failover).await?;
        let replica = self.replication_target()?;
        {
            let mut state = self.state.lock();
            match target {
                FailoverTarget::Secondary(id) if id != &replica.backend_id => {
                    return Err(Error::ReplicationNotConfigured {
                        backend: format!("{} -> {}", self.config.backend_name, id),
                    });
                }
                FailoverTarget::Default if state.sync_incomplete => {
                    return Err(Error::SyncIncomplete {
                        backend: self.config.backend_name.clone(),
                        reason: format!("replica {}s behind", state.lag_secs),
                    });
                }
                _ => {}
            }
            info!(
                "Memory array {} switching active side to {}",
                self.config.backend_name, target
            );
            state.active = target.clone();
        }
        self.leave(hang, ()).await
    }

    async fn replication_status(&self) -> Result<ReplicationStatus> {
        self.enter(DriverOp::ReplicationStatus).await?;
        self.replication_target()?;
        let state = self.state.lock();
        Ok(ReplicationStatus {
            sync_incomplete: state.sync_incomplete,
            lag_secs: state.lag_secs,
            active_target: state.active.clone(),
        })
    }

    async fn query_volume(&self, handle: &VolumeHandle) -> Result<Option<VolumeInfo>> {
        self.enter(DriverOp::Query).await?;
        let state = self.state.lock();
        Ok(state.volumes.get(&handle.provider_id).map(|v| VolumeInfo {
            provider_id: handle.provider_id.clone(),
            size_gb: v.size_gb,
            exported_to: v.exports.keys().cloned().collect(),
        }))
    }

    async fn query_snapshot(&self, snapshot: &SnapshotHandle) -> Result<bool> {
        self.enter(DriverOp::Query).await?;
        Ok(self.state.lock().snapshots.contains_key(&snapshot.provider_id))
    }

    fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    fn driver_name(&self) -> &str {
        "memory"
    }
}
