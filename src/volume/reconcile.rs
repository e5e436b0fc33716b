//! Reconciliation of Unknown Outcomes
//!
//! A driver call that timed out leaves its volume or snapshot in `error`
//! with a pending probe. A reconcile pass asks the array what actually
//! happened and moves each record to the state that matches.
//!
//! | Interrupted    | Array says    | Result                       |
//! |----------------|---------------|------------------------------|
//! | create         | exists        | available                    |
//! | create         | absent        | error (terminal)             |
//! | delete         | exists        | available                    |
//! | delete         | absent        | deleted                      |
//! | extend         | exists        | available at the probed size |
//! | attach, detach | (any)         | host unmapped, attachment dropped |
//!
//! A probe that itself fails leaves the record pending for the next pass.

use super::manager::VolumeManager;
use super::state::VolumeStatus;
use crate::domain::model::{InterruptedOperation, SnapshotPending, SnapshotStatus};
use crate::error::{Error, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// How one pending record was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    /// Back to a usable state
    Recovered,
    /// Settled as deleted
    Removed,
    /// Settled in terminal error
    Failed,
    /// Nothing was pending any more
    Skipped,
}

/// Outcome of one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub recovered: usize,
    pub removed: usize,
    pub failed: usize,
    /// Probe failed; retried on the next pass
    pub still_pending: usize,
}

impl ReconcileReport {
    fn record(&mut self, outcome: Result<Resolution>) {
        self.examined += 1;
        match outcome {
            Ok(Resolution::Recovered) => self.recovered += 1,
            Ok(Resolution::Removed) => self.removed += 1,
            Ok(Resolution::Failed) => self.failed += 1,
            Ok(Resolution::Skipped) => self.examined -= 1,
            Err(_) => self.still_pending += 1,
        }
    }
}

impl VolumeManager {
    /// Probe every pending record once
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let volume_ids: Vec<String> = self
            .volumes
            .read()
            .values()
            .filter(|v| v.status == VolumeStatus::Error && v.needs_verification())
            .map(|v| v.id.clone())
            .collect();
        for id in volume_ids {
            let outcome = self.reconcile_volume(&id).await;
            if let Err(e) = &outcome {
                warn!("Reconcile of volume {} deferred: {}", id, e);
            }
            report.record(outcome);
        }

        let snapshot_ids: Vec<String> = self
            .snapshots
            .read()
            .values()
            .filter(|s| s.pending.is_some())
            .map(|s| s.id.clone())
            .collect();
        for id in snapshot_ids {
            let outcome = self.reconcile_snapshot(&id).await;
            if let Err(e) = &outcome {
                warn!("Reconcile of snapshot {} deferred: {}", id, e);
            }
            report.record(outcome);
        }

        if report.examined > 0 {
            info!(
                "Reconcile pass: {} examined, {} recovered, {} removed, {} failed, {} pending",
                report.examined, report.recovered, report.removed, report.failed, report.still_pending
            );
        }
        report
    }

    async fn reconcile_volume(&self, volume_id: &str) -> Result<Resolution> {
        // Held across the probe: the volume is parked in error, so no other
        // operation is waiting to make progress on it
        let _guard = self.locks.lock(volume_id).await;
        let volume = self.volume(volume_id)?;
        let Some(pending) = volume.fault.as_ref().and_then(|f| f.pending.clone()) else {
            return Ok(Resolution::Skipped);
        };
        if volume.status != VolumeStatus::Error {
            return Ok(Resolution::Skipped);
        }
        if volume.backend.is_none() || volume.provider.is_none() {
            self.settle_terminal(volume_id, "nothing to probe")?;
            return Ok(Resolution::Failed);
        }

        let driver = self.driver_of(&volume)?;
        let handle = Self::handle_of(&volume)?;
        debug!("Probing volume {} after interrupted {:?}", volume_id, pending);

        match pending {
            InterruptedOperation::Create => match driver.query_volume(&handle).await? {
                Some(_) => self.settle_recovered(volume_id, None),
                None => {
                    self.settle_terminal(volume_id, "create did not reach the array")?;
                    Ok(Resolution::Failed)
                }
            },
            InterruptedOperation::Delete => match driver.query_volume(&handle).await? {
                Some(_) => self.settle_recovered(volume_id, None),
                None => {
                    self.with_volume(volume_id, |v| {
                        Self::transition(v, VolumeStatus::Deleted)?;
                        v.attachments.clear();
                        v.fault = None;
                        Ok(())
                    })?;
                    info!("Volume {} confirmed deleted", volume_id);
                    Ok(Resolution::Removed)
                }
            },
            InterruptedOperation::Extend { .. } => match driver.query_volume(&handle).await? {
                Some(info) => self.settle_recovered(volume_id, Some(info.size_gb)),
                None => {
                    self.settle_terminal(volume_id, "volume missing on the array")?;
                    Ok(Resolution::Failed)
                }
            },
            InterruptedOperation::Attach { host } | InterruptedOperation::Detach { host } => {
                // Unknown export state: unmap and let the consumer attach again
                driver.detach(&handle, &host).await?;
                self.with_volume(volume_id, |v| {
                    v.attachments.retain(|a| a.host.host != host.host);
                    let next = if v.attachments.is_empty() {
                        VolumeStatus::Available
                    } else {
                        VolumeStatus::InUse
                    };
                    Self::transition(v, next)?;
                    v.fault = None;
                    Ok(())
                })?;
                info!("Volume {} export to {} cleaned up", volume_id, host.host);
                Ok(Resolution::Recovered)
            }
        }
    }

    fn settle_recovered(&self, volume_id: &str, size_gb: Option<u64>) -> Result<Resolution> {
        self.with_volume(volume_id, |v| {
            if let Some(size) = size_gb {
                v.size_gb = size;
            }
            let next = if v.attachments.is_empty() {
                VolumeStatus::Available
            } else {
                VolumeStatus::InUse
            };
            Self::transition(v, next)?;
            v.fault = None;
            Ok(())
        })?;
        info!("Volume {} recovered", volume_id);
        Ok(Resolution::Recovered)
    }

    fn settle_terminal(&self, volume_id: &str, reason: &str) -> Result<()> {
        self.with_volume(volume_id, |v| {
            if let Some(fault) = v.fault.as_mut() {
                fault.pending = None;
                fault.reason = format!("{}; {}", fault.reason, reason);
            }
            // Terminal error volumes carry no attachments
            v.attachments.clear();
            Ok(())
        })?;
        warn!("Volume {} left in error: {}", volume_id, reason);
        Ok(())
    }

    async fn reconcile_snapshot(&self, snapshot_id: &str) -> Result<Resolution> {
        let parent_id = self.snapshot(snapshot_id)?.volume_id;
        let _guard = self.locks.lock(&parent_id).await;
        let snapshot = self.snapshot(snapshot_id)?;
        let Some(pending) = snapshot.pending else {
            return Ok(Resolution::Skipped);
        };
        let handle = snapshot.provider.clone().ok_or_else(|| {
            Error::Internal(format!("snapshot {} has no provider handle", snapshot_id))
        })?;
        let driver = self.registry.driver(&snapshot.backend)?;
        let exists = driver.query_snapshot(&handle).await?;

        let (status, resolution) = match (pending, exists) {
            (SnapshotPending::Create, true) => (SnapshotStatus::Available, Resolution::Recovered),
            (SnapshotPending::Create, false) => (SnapshotStatus::Error, Resolution::Failed),
            (SnapshotPending::Delete, true) => (SnapshotStatus::Available, Resolution::Recovered),
            (SnapshotPending::Delete, false) => (SnapshotStatus::Deleted, Resolution::Removed),
        };
        self.with_snapshot(snapshot_id, |s| {
            s.status = status;
            s.pending = None;
            Ok(())
        })?;
        info!("Snapshot {} reconciled to {}", snapshot_id, status);
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{
        CallPolicy, DriverKind, DriverOp, GuardedDriver, InjectedFault, MemoryDriver,
    };
    use crate::domain::ports::HostDescriptor;
    use crate::registry::{BackendRegistry, RegistryConfig};
    use crate::replication::ReplicationTable;
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use crate::volume::{CreateVolumeRequest, LockMode};
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup() -> (Arc<VolumeManager>, Arc<MemoryDriver>) {
        let registry = BackendRegistry::new(RegistryConfig::default());
        let driver = Arc::new(MemoryDriver::for_tests("pool-a", 200));
        let policy = CallPolicy {
            timeout: Duration::from_millis(100),
            max_attempts: 1,
            ..Default::default()
        };
        registry
            .register(
                "pool-a",
                DriverKind::Memory,
                GuardedDriver::new("pool-a", driver.clone(), policy),
                None,
            )
            .await
            .unwrap();
        let scheduler = Arc::new(Scheduler::new(registry.clone(), SchedulerConfig::default()));
        let manager = VolumeManager::new(
            registry,
            scheduler,
            Arc::new(ReplicationTable::new()),
            LockMode::Queue,
        );
        (Arc::new(manager), driver)
    }

    #[tokio::test]
    async fn test_create_applied_before_timeout_recovers() {
        let (manager, driver) = setup().await;
        driver.inject(DriverOp::Create, InjectedFault::ApplyThenHang);

        assert!(manager
            .create_volume(CreateVolumeRequest::new("data", 10))
            .await
            .is_err());
        let pending = manager.list_volumes().pop().unwrap();
        assert_eq!(pending.status, VolumeStatus::Error);
        assert!(pending.needs_verification());

        let report = manager.reconcile_once().await;
        assert_eq!(report.recovered, 1);
        let volume = manager.get_volume(&pending.id).unwrap();
        assert_eq!(volume.status, VolumeStatus::Available);
        assert!(volume.fault.is_none());
        assert!(driver.has_volume(&volume.id));
    }

    #[tokio::test]
    async fn test_create_lost_becomes_terminal_error() {
        let (manager, driver) = setup().await;
        driver.inject(DriverOp::Create, InjectedFault::Hang);
        assert!(manager
            .create_volume(CreateVolumeRequest::new("data", 10))
            .await
            .is_err());

        let report = manager.reconcile_once().await;
        assert_eq!(report.failed, 1);
        let volume = manager.list_volumes().pop().unwrap();
        assert_eq!(volume.status, VolumeStatus::Error);
        assert!(!volume.needs_verification());

        // Terminal error volumes can be deleted
        manager.delete_volume(&volume.id).await.unwrap();
        assert_eq!(manager.get_volume(&volume.id).unwrap().status, VolumeStatus::Deleted);
    }

    #[tokio::test]
    async fn test_delete_timeout_resolves_to_deleted() {
        let (manager, driver) = setup().await;
        let volume = manager
            .create_volume(CreateVolumeRequest::new("data", 10))
            .await
            .unwrap();
        driver.inject(DriverOp::Delete, InjectedFault::ApplyThenHang);
        assert!(manager.delete_volume(&volume.id).await.is_err());

        let report = manager.reconcile_once().await;
        assert_eq!(report.removed, 1);
        assert_eq!(manager.get_volume(&volume.id).unwrap().status, VolumeStatus::Deleted);
    }

    #[tokio::test]
    async fn test_attach_timeout_unmaps_host() {
        let (manager, driver) = setup().await;
        let volume = manager
            .create_volume(CreateVolumeRequest::new("data", 10))
            .await
            .unwrap();
        driver.inject(DriverOp::Attach, InjectedFault::ApplyThenHang);
        let host = HostDescriptor::iscsi("c1", "iqn.1994-05.com.redhat:c1");
        assert!(manager.attach(&volume.id, host).await.is_err());

        manager.reconcile_once().await;
        let volume = manager.get_volume(&volume.id).unwrap();
        assert_eq!(volume.status, VolumeStatus::Available);
        assert!(volume.attachments.is_empty());
        manager.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_probe_failure_stays_pending() {
        let (manager, driver) = setup().await;
        driver.inject(DriverOp::Create, InjectedFault::ApplyThenHang);
        assert!(manager
            .create_volume(CreateVolumeRequest::new("data", 10))
            .await
            .is_err());

        driver.set_unavailable(true);
        let report = manager.reconcile_once().await;
        assert_eq!(report.still_pending, 1);
        assert!(manager.list_volumes()[0].needs_verification());

        driver.set_unavailable(false);
        let report = manager.reconcile_once().await;
        assert_eq!(report.recovered, 1);
    }

    #[tokio::test]
    async fn test_snapshot_create_timeout_recovers() {
        let (manager, driver) = setup().await;
        let volume = manager
            .create_volume(CreateVolumeRequest::new("data", 10))
            .await
            .unwrap();
        driver.inject(DriverOp::Snapshot, InjectedFault::ApplyThenHang);
        assert!(manager.create_snapshot(&volume.id).await.is_err());

        let report = manager.reconcile_once().await;
        assert_eq!(report.recovered, 1);
        let snapshot = manager.list_snapshots(Some(&volume.id)).pop().unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Available);
    }
}
