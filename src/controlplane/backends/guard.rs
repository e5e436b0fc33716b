//! Guarded Driver Calls
//!
//! Wraps a [`VolumeDriver`] so every call is bounded by a timeout, counted
//! into backend load, and logged. Idempotent calls additionally get bounded
//! exponential-backoff retry on transient unavailability.

use crate::domain::ports::{
    CapabilityReport, ConnectionInfo, FailoverTarget, HostDescriptor, ReplicationStatus,
    SnapshotHandle, VolumeDriverRef, VolumeHandle, VolumeInfo, VolumeSpec,
};
use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Call Policy
// =============================================================================

/// Timeout and retry bounds for driver calls
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub timeout: Duration,
    /// Total attempts for idempotent calls, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Backend Load
// =============================================================================

/// Live call counters for one backend
#[derive(Debug, Default)]
pub struct BackendLoad {
    in_flight: AtomicU64,
    total_calls: AtomicU64,
    failed_calls: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of [`BackendLoad`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub in_flight: u64,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub timeouts: u64,
}

impl BackendLoad {
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Decrements in-flight on drop, so cancelled calls are not leaked
struct InFlight<'a>(&'a BackendLoad);

impl<'a> InFlight<'a> {
    fn enter(load: &'a BackendLoad) -> Self {
        load.in_flight.fetch_add(1, Ordering::Relaxed);
        load.total_calls.fetch_add(1, Ordering::Relaxed);
        Self(load)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Guarded Driver
// =============================================================================

/// Driver handle used by the registry, scheduler and state machines
#[derive(Clone)]
pub struct GuardedDriver {
    backend: String,
    inner: VolumeDriverRef,
    policy: CallPolicy,
    load: Arc<BackendLoad>,
}

impl std::fmt::Debug for GuardedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedDriver")
            .field("backend", &self.backend)
            .field("driver", &self.inner.driver_name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl GuardedDriver {
    pub fn new(backend: impl Into<String>, inner: VolumeDriverRef, policy: CallPolicy) -> Self {
        Self {
            backend: backend.into(),
            inner,
            policy,
            load: Arc::new(BackendLoad::default()),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn inner(&self) -> &VolumeDriverRef {
        &self.inner
    }

    pub fn load(&self) -> &Arc<BackendLoad> {
        &self.load
    }

    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    /// Single attempt under the timeout
    async fn run<T, Fut>(&self, operation: &'static str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _in_flight = InFlight::enter(&self.load);
        debug!("Driver call {} on {}", operation, self.backend);

        match tokio::time::timeout(self.policy.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.load.failed_calls.fetch_add(1, Ordering::Relaxed);
                warn!("Driver call {} on {} failed: {}", operation, self.backend, e);
                Err(e)
            }
            Err(_) => {
                self.load.failed_calls.fetch_add(1, Ordering::Relaxed);
                self.load.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Driver call {} on {} timed out after {:?}",
                    operation, self.backend, self.policy.timeout
                );
                Err(Error::DriverTimeout {
                    backend: self.backend.clone(),
                    operation: operation.to_string(),
                    timeout: self.policy.timeout,
                })
            }
        }
    }

    /// Bounded retry for calls that are safe to replay
    async fn run_idempotent<T, F, Fut>(&self, operation: &'static str, mut make: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.policy.initial_backoff)
            .with_max_interval(self.policy.max_backoff)
            .with_max_elapsed_time(None)
            .build();

        backoff::future::retry(policy, || {
            attempt += 1;
            let this_attempt = attempt;
            let call = self.run(operation, make());
            async move {
                call.await.map_err(|e| {
                    if e.is_transient() && this_attempt < max_attempts {
                        debug!(
                            "Retrying {} (attempt {}/{})",
                            operation, this_attempt, max_attempts
                        );
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }

    // =========================================================================
    // Mutating calls: never replayed
    // =========================================================================

    pub async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeHandle> {
        self.run("create_volume", self.inner.create_volume(spec))
            .await
    }

    pub async fn create_snapshot(
        &self,
        handle: &VolumeHandle,
        snapshot_id: &str,
    ) -> Result<SnapshotHandle> {
        self.run(
            "create_snapshot",
            self.inner.create_snapshot(handle, snapshot_id),
        )
        .await
    }

    pub async fn create_from_snapshot(
        &self,
        snapshot: &SnapshotHandle,
        spec: &VolumeSpec,
    ) -> Result<VolumeHandle> {
        self.run(
            "create_from_snapshot",
            self.inner.create_from_snapshot(snapshot, spec),
        )
        .await
    }

    pub async fn clone_volume(
        &self,
        source: &VolumeHandle,
        spec: &VolumeSpec,
    ) -> Result<VolumeHandle> {
        self.run("clone_volume", self.inner.clone_volume(source, spec))
            .await
    }

    pub async fn extend(&self, handle: &VolumeHandle, new_size_gb: u64) -> Result<()> {
        self.run("extend", self.inner.extend(handle, new_size_gb))
            .await
    }

    pub async fn attach(
        &self,
        handle: &VolumeHandle,
        host: &HostDescriptor,
    ) -> Result<ConnectionInfo> {
        self.run("attach", self.inner.attach(handle, host)).await
    }

    pub async fn failover(&self, target: &FailoverTarget) -> Result<()> {
        self.run("failover", self.inner.failover(target)).await
    }

    // =========================================================================
    // Idempotent calls
    // =========================================================================

    /// Delete; an already-missing volume counts as deleted
    pub async fn delete_volume(&self, handle: &VolumeHandle) -> Result<()> {
        let result = self
            .run_idempotent("delete_volume", || self.inner.delete_volume(handle))
            .await;
        ignore_not_found(result)
    }

    /// Delete; an already-missing snapshot counts as deleted
    pub async fn delete_snapshot(&self, snapshot: &SnapshotHandle) -> Result<()> {
        let result = self
            .run_idempotent("delete_snapshot", || self.inner.delete_snapshot(snapshot))
            .await;
        ignore_not_found(result)
    }

    /// Detach; a missing volume or mapping counts as detached
    pub async fn detach(&self, handle: &VolumeHandle, host: &HostDescriptor) -> Result<()> {
        let result = self
            .run_idempotent("detach", || self.inner.detach(handle, host))
            .await;
        ignore_not_found(result)
    }

    pub async fn get_capabilities(&self) -> Result<CapabilityReport> {
        self.run_idempotent("get_capabilities", || self.inner.get_capabilities())
            .await
    }

    pub async fn replication_status(&self) -> Result<ReplicationStatus> {
        self.run_idempotent("replication_status", || self.inner.replication_status())
            .await
    }

    pub async fn query_volume(&self, handle: &VolumeHandle) -> Result<Option<VolumeInfo>> {
        self.run_idempotent("query_volume", || self.inner.query_volume(handle))
            .await
    }

    pub async fn query_snapshot(&self, snapshot: &SnapshotHandle) -> Result<bool> {
        self.run_idempotent("query_snapshot", || self.inner.query_snapshot(snapshot))
            .await
    }
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::NotFound { kind, id }) => {
            debug!("Treating missing {}/{} as already removed", kind, id);
            Ok(())
        }
        other => other,
    }
}
