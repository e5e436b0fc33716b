//! Volume Manager
//!
//! Per-volume lifecycle controller. Every mutating operation follows the
//! same shape:
//!
//! 1. take the volume's lock, validate, move to the transitional status
//! 2. release the lock for the array round-trip
//! 3. re-take the lock and finalize, or apply the error's disposition
//!
//! Attach and detach keep the lock across the driver call so two attaches
//! never race on the same volume.

use super::locks::{LockMode, VolumeLocks};
use super::state::VolumeStatus;
use crate::controlplane::backends::GuardedDriver;
use crate::domain::model::{
    Attachment, InterruptedOperation, Snapshot, SnapshotPending, SnapshotStatus, Volume,
    VolumeFault, VolumeSource, VolumeType,
};
use crate::domain::ports::{HostDescriptor, SnapshotHandle, VolumeHandle, VolumeSpec};
use crate::error::{Error, FailureDisposition, Result};
use crate::registry::BackendRegistry;
use crate::replication::ReplicationTable;
use crate::scheduler::{PlacementRequest, Scheduler};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Extra-spec selecting thin or thick provisioning
pub const PROVISIONING_SPEC: &str = "provisioning:type";

// =============================================================================
// Requests
// =============================================================================

/// Parameters for a new volume
#[derive(Debug, Clone)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub size_gb: u64,
    pub volume_type: VolumeType,
    pub source: VolumeSource,
}

impl CreateVolumeRequest {
    pub fn new(name: impl Into<String>, size_gb: u64) -> Self {
        Self {
            name: name.into(),
            size_gb,
            volume_type: VolumeType::default(),
            source: VolumeSource::None,
        }
    }

    pub fn with_type(mut self, volume_type: VolumeType) -> Self {
        self.volume_type = volume_type;
        self
    }

    pub fn from_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.source = VolumeSource::Snapshot(snapshot_id.into());
        self
    }

    pub fn clone_of(mut self, volume_id: impl Into<String>) -> Self {
        self.source = VolumeSource::Volume(volume_id.into());
        self
    }

    /// Thin unless the type asks for thick
    pub fn thin(&self) -> bool {
        self.volume_type
            .extra_specs
            .get(PROVISIONING_SPEC)
            .map(|v| !v.trim().eq_ignore_ascii_case("thick"))
            .unwrap_or(true)
    }
}

/// Resolved source of a new volume
enum SourceRef {
    Blank,
    Snapshot(SnapshotHandle),
    Volume(VolumeHandle),
}

// =============================================================================
// Volume Manager
// =============================================================================

/// Owns volume and snapshot records and drives their state machines
pub struct VolumeManager {
    pub(super) registry: Arc<BackendRegistry>,
    pub(super) scheduler: Arc<Scheduler>,
    pub(super) replication: Arc<ReplicationTable>,
    pub(super) locks: VolumeLocks,
    pub(super) volumes: RwLock<HashMap<String, Volume>>,
    pub(super) snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl VolumeManager {
    pub fn new(
        registry: Arc<BackendRegistry>,
        scheduler: Arc<Scheduler>,
        replication: Arc<ReplicationTable>,
        lock_mode: LockMode,
    ) -> Self {
        Self {
            registry,
            scheduler,
            replication,
            locks: VolumeLocks::new(lock_mode),
            volumes: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    #[cfg(test)]
    pub(crate) fn locks(&self) -> &VolumeLocks {
        &self.locks
    }

    pub fn replication(&self) -> &Arc<ReplicationTable> {
        &self.replication
    }

    // =========================================================================
    // Record helpers
    // =========================================================================

    pub(super) fn volume(&self, volume_id: &str) -> Result<Volume> {
        self.volumes
            .read()
            .get(volume_id)
            .cloned()
            .ok_or_else(|| Error::not_found("volume", volume_id))
    }

    pub(super) fn snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.snapshots
            .read()
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| Error::not_found("snapshot", snapshot_id))
    }

    /// Mutate a volume record under the map's write lock
    pub(super) fn with_volume<T>(
        &self,
        volume_id: &str,
        f: impl FnOnce(&mut Volume) -> Result<T>,
    ) -> Result<T> {
        let mut volumes = self.volumes.write();
        let volume = volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::not_found("volume", volume_id))?;
        let out = f(volume)?;
        volume.updated_at = Utc::now();
        Ok(out)
    }

    pub(super) fn with_snapshot<T>(
        &self,
        snapshot_id: &str,
        f: impl FnOnce(&mut Snapshot) -> Result<T>,
    ) -> Result<T> {
        let mut snapshots = self.snapshots.write();
        let snapshot = snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| Error::not_found("snapshot", snapshot_id))?;
        f(snapshot)
    }

    /// Apply a status change, refusing anything outside the table
    pub(super) fn transition(volume: &mut Volume, next: VolumeStatus) -> Result<()> {
        if !volume.status.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "illegal transition {} -> {} for volume {}",
                volume.status, next, volume.id
            )));
        }
        debug!("Volume {}: {} -> {}", volume.id, volume.status, next);
        volume.status = next;
        Ok(())
    }

    /// Shared preconditions of a mutating operation
    fn check_ready(&self, volume: &Volume, operation: &str, allowed: &[VolumeStatus]) -> Result<()> {
        if volume.status.is_transitional() {
            return Err(Error::ConflictingOperation {
                volume_id: volume.id.clone(),
                status: volume.status.to_string(),
            });
        }
        if !allowed.contains(&volume.status) {
            return Err(Error::InvalidState {
                volume_id: volume.id.clone(),
                status: volume.status.to_string(),
                operation: operation.to_string(),
            });
        }
        if let Some(backend) = &volume.backend {
            self.replication.ensure_stable(backend)?;
        }
        Ok(())
    }

    pub(super) fn driver_of(&self, volume: &Volume) -> Result<GuardedDriver> {
        let backend = volume
            .backend
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("volume {} has no backend", volume.id)))?;
        self.registry.driver(backend)
    }

    pub(super) fn handle_of(volume: &Volume) -> Result<VolumeHandle> {
        volume
            .provider
            .clone()
            .ok_or_else(|| Error::Internal(format!("volume {} has no provider handle", volume.id)))
    }

    fn has_live_snapshots(&self, volume_id: &str) -> bool {
        self.snapshots
            .read()
            .values()
            .any(|s| s.volume_id == volume_id && s.is_live())
    }

    /// Apply the error's disposition and hand the error back
    fn settle_failure(
        &self,
        volume_id: &str,
        prior: VolumeStatus,
        interrupted: InterruptedOperation,
        err: Error,
    ) -> Error {
        let outcome = self.with_volume(volume_id, |volume| {
            let mut disposition = err.disposition();
            // An error volume may only keep attachments while it awaits reconciliation
            if disposition == FailureDisposition::MarkError && !volume.attachments.is_empty() {
                disposition = FailureDisposition::MarkErrorPendingVerification;
            }
            match disposition {
                FailureDisposition::Revert => Self::transition(volume, prior)?,
                FailureDisposition::MarkErrorPendingVerification => {
                    Self::transition(volume, VolumeStatus::Error)?;
                    volume.fault = Some(VolumeFault {
                        reason: err.to_string(),
                        pending: Some(interrupted),
                        at: Utc::now(),
                    });
                }
                FailureDisposition::MarkError => {
                    Self::transition(volume, VolumeStatus::Error)?;
                    volume.fault = Some(VolumeFault {
                        reason: err.to_string(),
                        pending: None,
                        at: Utc::now(),
                    });
                }
            }
            Ok(disposition)
        });

        match outcome {
            Ok(FailureDisposition::Revert) => {
                warn!("Volume {} reverted to {}: {}", volume_id, prior, err)
            }
            Ok(disposition) => warn!("Volume {} marked error ({:?}): {}", volume_id, disposition, err),
            Err(e) => error!("Volume {} could not record failure {}: {}", volume_id, err, e),
        }
        err
    }

    // =========================================================================
    // Create / Delete
    // =========================================================================

    /// Place and create a volume, optionally from a snapshot or clone source
    pub async fn create_volume(&self, request: CreateVolumeRequest) -> Result<Volume> {
        if request.size_gb == 0 {
            return Err(Error::InvalidRequest("volume size must be at least 1 GiB".into()));
        }
        let (source, pinned) = self.resolve_source(&request)?;
        if let Some(backend) = &pinned {
            self.replication.ensure_stable(backend)?;
        }

        let thin = request.thin();
        let now = Utc::now();
        let volume = Volume {
            id: Uuid::new_v4().to_string(),
            display_name: request.name.clone(),
            size_gb: request.size_gb,
            status: VolumeStatus::Creating,
            backend: None,
            active_backend_id: None,
            volume_type: request.volume_type.clone(),
            thin,
            replication_enabled: request.volume_type.wants_replication(),
            source: request.source.clone(),
            provider: None,
            attachments: Vec::new(),
            fault: None,
            created_at: now,
            updated_at: now,
        };
        let volume_id = volume.id.clone();
        self.volumes.write().insert(volume_id.clone(), volume);
        info!(
            "Creating volume {} ({} GiB, type {:?})",
            volume_id, request.size_gb, request.volume_type.name
        );

        let placement = PlacementRequest {
            size_gb: request.size_gb,
            extra_specs: request.volume_type.extra_specs.clone(),
            thin,
            pinned_backend: pinned,
            exclude: self.replication.in_transition(),
        };
        let spec = VolumeSpec {
            volume_id: volume_id.clone(),
            name: request.name.clone(),
            size_gb: request.size_gb,
            thin,
            extra_specs: request.volume_type.extra_specs.clone(),
        };

        let result = self
            .scheduler
            .place(&placement, |driver| {
                let spec = &spec;
                let source = &source;
                async move {
                    match source {
                        SourceRef::Blank => driver.create_volume(spec).await,
                        SourceRef::Snapshot(snapshot) => {
                            driver.create_from_snapshot(snapshot, spec).await
                        }
                        SourceRef::Volume(parent) => driver.clone_volume(parent, spec).await,
                    }
                }
            })
            .await;

        let _guard = self.locks.lock(&volume_id).await;
        match result {
            Ok(placed) => {
                let volume = self.with_volume(&volume_id, |v| {
                    v.backend = Some(placed.backend.clone());
                    v.provider = Some(placed.value.clone());
                    // Read under the record lock so a settling switch cannot be missed
                    if v.replication_enabled {
                        v.active_backend_id = self.replication.active_backend_id(&placed.backend);
                    }
                    Self::transition(v, VolumeStatus::Available)?;
                    Ok(v.clone())
                })?;
                info!("Volume {} available on {}", volume_id, placed.backend);
                Ok(volume)
            }
            Err(err) => {
                // A timed-out create may exist on the array it was sent to
                let timed_out_on = match &err {
                    Error::DriverTimeout { backend, .. } => Some(backend.clone()),
                    _ => None,
                };
                let recorded = self.with_volume(&volume_id, |v| {
                    let pending = timed_out_on.is_some();
                    if let Some(backend) = timed_out_on {
                        v.backend = Some(backend);
                        v.provider = Some(VolumeHandle {
                            provider_id: v.id.clone(),
                            provider_location: None,
                        });
                    }
                    Self::transition(v, VolumeStatus::Error)?;
                    v.fault = Some(VolumeFault {
                        reason: err.to_string(),
                        pending: pending.then_some(InterruptedOperation::Create),
                        at: Utc::now(),
                    });
                    Ok(())
                });
                if let Err(e) = recorded {
                    error!("Volume {} could not record create failure: {}", volume_id, e);
                }
                warn!("Create of volume {} failed: {}", volume_id, err);
                Err(err)
            }
        }
    }

    fn resolve_source(&self, request: &CreateVolumeRequest) -> Result<(SourceRef, Option<String>)> {
        match &request.source {
            VolumeSource::None => Ok((SourceRef::Blank, None)),
            VolumeSource::Snapshot(snapshot_id) => {
                let snapshot = self.snapshot(snapshot_id)?;
                if snapshot.status != SnapshotStatus::Available {
                    return Err(Error::InvalidRequest(format!(
                        "snapshot {} is {}",
                        snapshot_id, snapshot.status
                    )));
                }
                if request.size_gb < snapshot.size_gb {
                    return Err(Error::InvalidRequest(format!(
                        "volume of {} GiB cannot hold snapshot of {} GiB",
                        request.size_gb, snapshot.size_gb
                    )));
                }
                let handle = snapshot.provider.clone().ok_or_else(|| {
                    Error::Internal(format!("snapshot {} has no provider handle", snapshot_id))
                })?;
                Ok((SourceRef::Snapshot(handle), Some(snapshot.backend)))
            }
            VolumeSource::Volume(volume_id) => {
                let parent = self.volume(volume_id)?;
                self.check_ready(
                    &parent,
                    "clone",
                    &[VolumeStatus::Available, VolumeStatus::InUse],
                )?;
                if request.size_gb < parent.size_gb {
                    return Err(Error::InvalidRequest(format!(
                        "clone of {} GiB cannot hold source of {} GiB",
                        request.size_gb, parent.size_gb
                    )));
                }
                let handle = Self::handle_of(&parent)?;
                Ok((SourceRef::Volume(handle), parent.backend))
            }
        }
    }

    /// Delete a volume. Deleting a deleted volume is a no-op.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let guard = self.locks.acquire(volume_id).await?;
        let volume = self.volume(volume_id)?;

        if volume.status == VolumeStatus::Deleted {
            debug!("Volume {} already deleted", volume_id);
            return Ok(());
        }
        if volume.status.is_transitional() {
            return Err(Error::ConflictingOperation {
                volume_id: volume_id.to_string(),
                status: volume.status.to_string(),
            });
        }
        if volume.ref_count() > 0 || volume.status == VolumeStatus::InUse {
            return Err(Error::InUse {
                kind: "volume".into(),
                id: volume_id.to_string(),
                reason: format!("attached to {} host(s)", volume.attachments.len()),
            });
        }
        if self.has_live_snapshots(volume_id) {
            return Err(Error::InUse {
                kind: "volume".into(),
                id: volume_id.to_string(),
                reason: "dependent snapshots exist".into(),
            });
        }
        let cloning = self
            .volumes
            .read()
            .values()
            .any(|v| v.status == VolumeStatus::Creating && v.source.volume_id() == Some(volume_id));
        if cloning {
            return Err(Error::InUse {
                kind: "volume".into(),
                id: volume_id.to_string(),
                reason: "a clone is being created from it".into(),
            });
        }
        self.check_ready(
            &volume,
            "delete",
            &[VolumeStatus::Available, VolumeStatus::Error],
        )?;

        let target = match &volume.provider {
            Some(handle) if volume.backend.is_some() => Some((self.driver_of(&volume)?, handle.clone())),
            _ => None,
        };
        let prior = volume.status;
        self.with_volume(volume_id, |v| Self::transition(v, VolumeStatus::Deleting))?;
        drop(guard);

        let result = match &target {
            Some((driver, handle)) => driver.delete_volume(handle).await,
            None => Ok(()),
        };

        let guard = self.locks.lock(volume_id).await;
        let outcome = match result {
            Ok(()) => {
                self.with_volume(volume_id, |v| {
                    Self::transition(v, VolumeStatus::Deleted)?;
                    v.attachments.clear();
                    v.fault = None;
                    Ok(())
                })?;
                info!("Deleted volume {}", volume_id);
                Ok(())
            }
            Err(e) => Err(self.settle_failure(volume_id, prior, InterruptedOperation::Delete, e)),
        };
        drop(guard);
        self.locks.forget(volume_id);
        outcome
    }

    // =========================================================================
    // Extend / Retype
    // =========================================================================

    /// Grow an available volume
    pub async fn extend_volume(&self, volume_id: &str, new_size_gb: u64) -> Result<Volume> {
        let guard = self.locks.acquire(volume_id).await?;
        let volume = self.volume(volume_id)?;
        self.check_ready(&volume, "extend", &[VolumeStatus::Available])?;

        if new_size_gb <= volume.size_gb {
            return Err(Error::InvalidRequest(format!(
                "new size {} GiB must exceed current {} GiB",
                new_size_gb, volume.size_gb
            )));
        }
        if self.has_live_snapshots(volume_id) {
            let allowed = volume
                .backend
                .as_deref()
                .and_then(|b| self.registry.get(b))
                .and_then(|b| b.report)
                .map(|r| r.supports_extend_with_snapshots)
                .unwrap_or(true);
            if !allowed {
                return Err(Error::HasSnapshots {
                    volume_id: volume_id.to_string(),
                });
            }
        }

        let driver = self.driver_of(&volume)?;
        let handle = Self::handle_of(&volume)?;
        self.with_volume(volume_id, |v| Self::transition(v, VolumeStatus::Extending))?;
        drop(guard);

        let result = driver.extend(&handle, new_size_gb).await;

        let _guard = self.locks.lock(volume_id).await;
        match result {
            Ok(()) => self.with_volume(volume_id, |v| {
                v.size_gb = new_size_gb;
                Self::transition(v, VolumeStatus::Available)?;
                Ok(v.clone())
            }),
            Err(e) => Err(self.settle_failure(
                volume_id,
                VolumeStatus::Available,
                InterruptedOperation::Extend { new_size_gb },
                e,
            )),
        }
    }

    /// Change a volume's type in place; the current backend must satisfy it
    pub async fn retype_volume(&self, volume_id: &str, new_type: VolumeType) -> Result<Volume> {
        let _guard = self.locks.acquire(volume_id).await?;
        let volume = self.volume(volume_id)?;
        self.check_ready(&volume, "retype", &[VolumeStatus::Available])?;

        let backend_name = volume
            .backend
            .clone()
            .ok_or_else(|| Error::Internal(format!("volume {} has no backend", volume_id)))?;
        let backend = self
            .registry
            .get(&backend_name)
            .ok_or_else(|| Error::not_found("backend", &backend_name))?;

        let request = PlacementRequest {
            size_gb: 0,
            extra_specs: new_type.extra_specs.clone(),
            thin: volume.thin,
            pinned_backend: Some(backend_name.clone()),
            exclude: Default::default(),
        };
        self.scheduler
            .rank(std::slice::from_ref(&backend), &request)
            .map_err(|e| match e {
                Error::NoValidBackend { reason } => Error::NoValidBackend {
                    reason: format!("retype requires migration: {}", reason),
                },
                other => other,
            })?;

        let active = self.replication.active_backend_id(&backend_name);
        let volume = self.with_volume(volume_id, |v| {
            Self::transition(v, VolumeStatus::Retyping)?;
            v.replication_enabled = new_type.wants_replication();
            v.active_backend_id = if v.replication_enabled { active } else { None };
            v.volume_type = new_type;
            Self::transition(v, VolumeStatus::Available)?;
            Ok(v.clone())
        })?;
        info!("Retyped volume {} to {:?}", volume_id, volume.volume_type.name);
        Ok(volume)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Snapshot an available or in-use volume
    pub async fn create_snapshot(&self, volume_id: &str) -> Result<Snapshot> {
        let guard = self.locks.acquire(volume_id).await?;
        let volume = self.volume(volume_id)?;
        self.check_ready(
            &volume,
            "snapshot",
            &[VolumeStatus::Available, VolumeStatus::InUse],
        )?;
        let driver = self.driver_of(&volume)?;
        let handle = Self::handle_of(&volume)?;

        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            volume_id: volume_id.to_string(),
            backend: driver.backend().to_string(),
            size_gb: volume.size_gb,
            status: SnapshotStatus::Creating,
            consumption_ratio: 0.0,
            provider: None,
            pending: None,
            created_at: Utc::now(),
        };
        let snapshot_id = snapshot.id.clone();
        self.snapshots.write().insert(snapshot_id.clone(), snapshot);
        drop(guard);

        let result = driver.create_snapshot(&handle, &snapshot_id).await;

        let _guard = self.locks.lock(volume_id).await;
        match result {
            Ok(created) => {
                let snapshot = self.with_snapshot(&snapshot_id, |s| {
                    s.size_gb = created.size_gb;
                    s.consumption_ratio = created.consumption_ratio;
                    s.provider = Some(created);
                    s.status = SnapshotStatus::Available;
                    Ok(s.clone())
                })?;
                info!("Snapshot {} of volume {} available", snapshot_id, volume_id);
                Ok(snapshot)
            }
            Err(e) => {
                let disposition = e.disposition();
                self.with_snapshot(&snapshot_id, |s| {
                    match disposition {
                        // Never existed on the array
                        FailureDisposition::Revert => s.status = SnapshotStatus::Deleted,
                        FailureDisposition::MarkErrorPendingVerification => {
                            s.status = SnapshotStatus::Error;
                            s.pending = Some(SnapshotPending::Create);
                            s.provider = Some(SnapshotHandle {
                                provider_id: s.id.clone(),
                                volume_provider_id: handle.provider_id.clone(),
                                size_gb: s.size_gb,
                                consumption_ratio: 0.0,
                            });
                        }
                        FailureDisposition::MarkError => s.status = SnapshotStatus::Error,
                    }
                    Ok(())
                })?;
                warn!("Snapshot of volume {} failed: {}", volume_id, e);
                Err(e)
            }
        }
    }

    /// Delete a snapshot no volume was created from
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let parent_id = self.snapshot(snapshot_id)?.volume_id;
        let guard = self.locks.acquire(&parent_id).await?;
        let snapshot = self.snapshot(snapshot_id)?;

        match snapshot.status {
            SnapshotStatus::Deleted => return Ok(()),
            SnapshotStatus::Creating | SnapshotStatus::Deleting => {
                return Err(Error::ConflictingOperation {
                    volume_id: parent_id,
                    status: format!("snapshot {} {}", snapshot_id, snapshot.status),
                })
            }
            SnapshotStatus::Available | SnapshotStatus::Error => {}
        }
        let dependents = self
            .volumes
            .read()
            .values()
            .filter(|v| v.status != VolumeStatus::Deleted && v.source.snapshot_id() == Some(snapshot_id))
            .count();
        if dependents > 0 {
            return Err(Error::InUse {
                kind: "snapshot".into(),
                id: snapshot_id.to_string(),
                reason: format!("{} volume(s) were created from it", dependents),
            });
        }
        self.replication.ensure_stable(&snapshot.backend)?;

        let target = match &snapshot.provider {
            Some(handle) => Some((self.registry.driver(&snapshot.backend)?, handle.clone())),
            None => None,
        };
        let prior = snapshot.status;
        self.with_snapshot(snapshot_id, |s| {
            s.status = SnapshotStatus::Deleting;
            Ok(())
        })?;
        drop(guard);

        let result = match &target {
            Some((driver, handle)) => driver.delete_snapshot(handle).await,
            None => Ok(()),
        };

        let _guard = self.locks.lock(&parent_id).await;
        match result {
            Ok(()) => {
                self.with_snapshot(snapshot_id, |s| {
                    s.status = SnapshotStatus::Deleted;
                    s.pending = None;
                    Ok(())
                })?;
                info!("Deleted snapshot {}", snapshot_id);
                Ok(())
            }
            Err(e) => {
                let disposition = e.disposition();
                self.with_snapshot(snapshot_id, |s| {
                    match disposition {
                        FailureDisposition::Revert => s.status = prior,
                        FailureDisposition::MarkErrorPendingVerification => {
                            s.status = SnapshotStatus::Error;
                            s.pending = Some(SnapshotPending::Delete);
                        }
                        FailureDisposition::MarkError => s.status = SnapshotStatus::Error,
                    }
                    Ok(())
                })?;
                warn!("Delete of snapshot {} failed: {}", snapshot_id, e);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Attach / Detach
    // =========================================================================

    /// Export a volume to a host. The lock is held for the whole call.
    pub async fn attach(&self, volume_id: &str, host: HostDescriptor) -> Result<Attachment> {
        let _guard = self.locks.acquire(volume_id).await?;
        let volume = self.volume(volume_id)?;
        self.check_ready(
            &volume,
            "attach",
            &[VolumeStatus::Available, VolumeStatus::InUse],
        )?;
        let driver = self.driver_of(&volume)?;
        let handle = Self::handle_of(&volume)?;
        host.validate_for(driver.inner().protocol())?;

        match volume.attachment_for(&host.host) {
            Some(existing) if !existing.stale => {
                return self.with_volume(volume_id, |v| {
                    let attachment = v
                        .attachments
                        .iter_mut()
                        .find(|a| a.host.host == host.host)
                        .ok_or_else(|| Error::Internal("attachment vanished".into()))?;
                    attachment.ref_count += 1;
                    debug!(
                        "Volume {} already attached to {} (refs {})",
                        volume_id, host.host, attachment.ref_count
                    );
                    Ok(attachment.clone())
                });
            }
            Some(_) => debug!("Re-establishing stale attachment of {} to {}", volume_id, host.host),
            None if !volume.attachments.is_empty() => {
                let backend_allows = volume
                    .backend
                    .as_deref()
                    .and_then(|b| self.registry.get(b))
                    .and_then(|b| b.report)
                    .map(|r| r.multiattach)
                    .unwrap_or(false);
                if !(volume.volume_type.allows_multiattach() && backend_allows) {
                    let hosts: Vec<&str> =
                        volume.attachments.iter().map(|a| a.host.host.as_str()).collect();
                    return Err(Error::InUse {
                        kind: "volume".into(),
                        id: volume_id.to_string(),
                        reason: format!("attached to {} and multiattach is not enabled", hosts.join(",")),
                    });
                }
            }
            None => {}
        }

        let prior = volume.status;
        self.with_volume(volume_id, |v| Self::transition(v, VolumeStatus::Attaching))?;

        match driver.attach(&handle, &host).await {
            Ok(connection_info) => {
                let attachment = self.with_volume(volume_id, |v| {
                    let index = match v.attachments.iter().position(|a| a.host.host == host.host) {
                        Some(index) => {
                            let a = &mut v.attachments[index];
                            a.host = host.clone();
                            a.connection_info = connection_info;
                            a.stale = false;
                            a.ref_count += 1;
                            index
                        }
                        None => {
                            v.attachments.push(Attachment {
                                id: Uuid::new_v4().to_string(),
                                host: host.clone(),
                                connection_info,
                                ref_count: 1,
                                stale: false,
                                attached_at: Utc::now(),
                            });
                            v.attachments.len() - 1
                        }
                    };
                    Self::transition(v, VolumeStatus::InUse)?;
                    Ok(v.attachments[index].clone())
                })?;
                info!("Attached volume {} to {}", volume_id, host.host);
                Ok(attachment)
            }
            Err(e) => Err(self.settle_failure(
                volume_id,
                prior,
                InterruptedOperation::Attach { host },
                e,
            )),
        }
    }

    /// Drop one reference of a host's attachment; unknown hosts are a no-op
    pub async fn detach(&self, volume_id: &str, host_name: &str) -> Result<()> {
        let _guard = self.locks.acquire(volume_id).await?;
        let volume = self.volume(volume_id)?;

        let Some(attachment) = volume.attachment_for(host_name).cloned() else {
            debug!("Volume {} not attached to {}", volume_id, host_name);
            return Ok(());
        };
        self.check_ready(&volume, "detach", &[VolumeStatus::InUse])?;

        if attachment.ref_count > 1 {
            return self.with_volume(volume_id, |v| {
                if let Some(a) = v.attachments.iter_mut().find(|a| a.host.host == host_name) {
                    a.ref_count -= 1;
                }
                Ok(())
            });
        }

        let driver = self.driver_of(&volume)?;
        let handle = Self::handle_of(&volume)?;
        self.with_volume(volume_id, |v| Self::transition(v, VolumeStatus::Detaching))?;

        match driver.detach(&handle, &attachment.host).await {
            Ok(()) => {
                self.with_volume(volume_id, |v| {
                    v.attachments.retain(|a| a.host.host != host_name);
                    let next = if v.attachments.is_empty() {
                        VolumeStatus::Available
                    } else {
                        VolumeStatus::InUse
                    };
                    Self::transition(v, next)
                })?;
                info!("Detached volume {} from {}", volume_id, host_name);
                Ok(())
            }
            Err(e) => Err(self.settle_failure(
                volume_id,
                VolumeStatus::InUse,
                InterruptedOperation::Detach {
                    host: attachment.host,
                },
                e,
            )),
        }
    }

    // =========================================================================
    // Backup / Restore bookkeeping
    // =========================================================================

    /// Mark a volume as being read by an external backup service
    pub async fn begin_backup(&self, volume_id: &str) -> Result<Volume> {
        let _guard = self.locks.acquire(volume_id).await?;
        let volume = self.volume(volume_id)?;
        self.check_ready(
            &volume,
            "backup",
            &[VolumeStatus::Available, VolumeStatus::InUse],
        )?;
        self.with_volume(volume_id, |v| {
            Self::transition(v, VolumeStatus::BackingUp)?;
            Ok(v.clone())
        })
    }

    /// Return from backing-up; a failed backup leaves the volume intact
    pub async fn complete_backup(&self, volume_id: &str, succeeded: bool) -> Result<Volume> {
        let _guard = self.locks.lock(volume_id).await;
        self.with_volume(volume_id, |v| {
            if v.status != VolumeStatus::BackingUp {
                return Err(Error::InvalidState {
                    volume_id: v.id.clone(),
                    status: v.status.to_string(),
                    operation: "complete backup".into(),
                });
            }
            if !succeeded {
                warn!("Backup of volume {} failed", v.id);
            }
            let next = if v.attachments.is_empty() {
                VolumeStatus::Available
            } else {
                VolumeStatus::InUse
            };
            Self::transition(v, next)?;
            Ok(v.clone())
        })
    }

    /// Mark a volume as being overwritten by an external restore
    pub async fn begin_restore(&self, volume_id: &str) -> Result<Volume> {
        let _guard = self.locks.acquire(volume_id).await?;
        let volume = self.volume(volume_id)?;
        self.check_ready(&volume, "restore", &[VolumeStatus::Available])?;
        self.with_volume(volume_id, |v| {
            Self::transition(v, VolumeStatus::Restoring)?;
            Ok(v.clone())
        })
    }

    /// Return from restoring; a failed restore leaves content undefined
    pub async fn complete_restore(&self, volume_id: &str, succeeded: bool) -> Result<Volume> {
        let _guard = self.locks.lock(volume_id).await;
        self.with_volume(volume_id, |v| {
            if v.status != VolumeStatus::Restoring {
                return Err(Error::InvalidState {
                    volume_id: v.id.clone(),
                    status: v.status.to_string(),
                    operation: "complete restore".into(),
                });
            }
            if succeeded {
                Self::transition(v, VolumeStatus::Available)?;
            } else {
                Self::transition(v, VolumeStatus::Error)?;
                v.fault = Some(VolumeFault {
                    reason: "restore failed; content undefined".into(),
                    pending: None,
                    at: Utc::now(),
                });
            }
            Ok(v.clone())
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        self.volume(volume_id)
    }

    /// All volumes, oldest first
    pub fn list_volumes(&self) -> Vec<Volume> {
        let mut volumes: Vec<Volume> = self.volumes.read().values().cloned().collect();
        volumes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        volumes
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.snapshot(snapshot_id)
    }

    /// Snapshots, optionally of one volume, oldest first
    pub fn list_snapshots(&self, volume_id: Option<&str>) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self
            .snapshots
            .read()
            .values()
            .filter(|s| volume_id.map(|id| s.volume_id == id).unwrap_or(true))
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Volume count per status
    pub fn status_counts(&self) -> BTreeMap<VolumeStatus, usize> {
        let mut counts = BTreeMap::new();
        for volume in self.volumes.read().values() {
            *counts.entry(volume.status).or_insert(0) += 1;
        }
        counts
    }

    // =========================================================================
    // Replication support
    // =========================================================================

    /// Point every replicated volume on `primary` at `active_backend_id`.
    ///
    /// Each volume is updated under its own lock, so an attach that is
    /// still in flight finishes before its attachment is marked stale.
    pub async fn rebind_pair(
        &self,
        primary: &str,
        active_backend_id: Option<&str>,
        mark_stale: bool,
    ) -> usize {
        let ids: Vec<String> = self
            .volumes
            .read()
            .values()
            .filter(|v| {
                v.backend.as_deref() == Some(primary)
                    && v.replication_enabled
                    && v.status != VolumeStatus::Deleted
            })
            .map(|v| v.id.clone())
            .collect();

        let mut rebound = 0;
        for id in ids {
            let _guard = self.locks.lock(&id).await;
            let updated = self.with_volume(&id, |v| {
                v.active_backend_id = active_backend_id.map(String::from);
                if mark_stale {
                    for attachment in &mut v.attachments {
                        attachment.stale = true;
                    }
                }
                Ok(())
            });
            if updated.is_ok() {
                rebound += 1;
            }
        }
        info!(
            "Rebound {} volume(s) on {} to {}",
            rebound,
            primary,
            active_backend_id.unwrap_or("primary")
        );
        rebound
    }

    /// Copy the pair's settled active side onto volumes on `primary` that
    /// missed it; returns how many changed
    pub async fn sync_active_backend(&self, primary: &str) -> usize {
        let ids: Vec<String> = self
            .volumes
            .read()
            .values()
            .filter(|v| {
                v.backend.as_deref() == Some(primary)
                    && v.replication_enabled
                    && v.status != VolumeStatus::Deleted
            })
            .map(|v| v.id.clone())
            .collect();

        let mut changed = 0;
        for id in ids {
            let _guard = self.locks.lock(&id).await;
            let updated = self.with_volume(&id, |v| {
                let active = self.replication.active_backend_id(primary);
                if v.active_backend_id == active {
                    return Ok(false);
                }
                v.active_backend_id = active;
                Ok(true)
            });
            if let Ok(true) = updated {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!("Synced active backend of {} volume(s) on {}", changed, primary);
        }
        changed
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    /// Check record-level invariants; returns every violation found
    pub fn check_invariants(&self) -> Result<()> {
        let volumes = self.volumes.read();
        let snapshots = self.snapshots.read();
        let mut violations = Vec::new();

        for v in volumes.values() {
            match v.status {
                VolumeStatus::Deleted if !v.attachments.is_empty() => {
                    violations.push(format!("deleted volume {} has attachments", v.id))
                }
                VolumeStatus::Error if !v.needs_verification() && !v.attachments.is_empty() => {
                    violations.push(format!("error volume {} has attachments", v.id))
                }
                VolumeStatus::Available if !v.attachments.is_empty() => {
                    violations.push(format!("available volume {} has attachments", v.id))
                }
                VolumeStatus::InUse if v.attachments.is_empty() => {
                    violations.push(format!("in-use volume {} has no attachments", v.id))
                }
                _ => {}
            }
            if v.attachments.iter().any(|a| a.ref_count == 0) {
                violations.push(format!("volume {} has a zero-ref attachment", v.id));
            }
            if v.attachments.len() > 1 && !v.volume_type.allows_multiattach() {
                violations.push(format!("volume {} multi-attached without multiattach", v.id));
            }
            let placed = !matches!(
                v.status,
                VolumeStatus::Creating | VolumeStatus::Error | VolumeStatus::Deleted
            );
            if placed && v.backend.is_none() {
                violations.push(format!("volume {} is {} without a backend", v.id, v.status));
            }
        }

        for s in snapshots.values().filter(|s| s.is_live()) {
            match volumes.get(&s.volume_id) {
                Some(parent) if parent.status == VolumeStatus::Deleted => violations.push(format!(
                    "snapshot {} outlives deleted volume {}",
                    s.id, s.volume_id
                )),
                None => violations.push(format!("snapshot {} has no parent record", s.id)),
                _ => {}
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(violations.join("; ")))
        }
    }
}
