//! Volume Service - The control plane entry point
//!
//! Wires the backend registry, scheduler, volume manager, replication
//! coordinator and worker pool together from one [`ServiceConfig`]:
//! - Backend construction and registration from config sections
//! - Volume and snapshot operations, run on the worker pool
//! - Failover and failback
//! - Background capability refresh and reconciliation
//! - Metrics and status

use crate::controlplane::backends::{BackendFactory, CallPolicy, GuardedDriver};
use crate::controlplane::config::{BackendSection, ServiceConfig};
use crate::controlplane::metrics::ServiceMetrics;
use crate::controlplane::workers::{WorkerConfig, WorkerPool, WorkerStats};
use crate::domain::model::{Attachment, Snapshot, Volume, VolumeType};
use crate::domain::ports::HostDescriptor;
use crate::error::{Error, Result};
use crate::registry::{BackendRegistry, RegistryConfig};
use crate::replication::{FailoverCoordinator, FailoverOutcome, PairEntry, PairReport, ReplicationTable};
use crate::scheduler::{Scheduler, SchedulerConfig, WeigherConfig};
use crate::volume::{CreateVolumeRequest, ReconcileReport, VolumeManager};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// =============================================================================
// Status
// =============================================================================

/// One backend as seen by the service
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub driver: String,
    pub health: String,
    pub total_capacity_gb: Option<f64>,
    pub free_capacity_gb: Option<f64>,
    pub total_volumes: Option<u64>,
    pub in_flight: u64,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Service-wide status
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: String,
    pub ready: bool,
    pub backends: Vec<BackendStatus>,
    /// Sections that failed validation, with the reason
    pub excluded_backends: BTreeMap<String, String>,
    pub volumes_by_status: BTreeMap<String, usize>,
    pub replication_pairs: Vec<PairEntry>,
    pub workers: WorkerStats,
}

// =============================================================================
// Volume Service
// =============================================================================

pub struct VolumeService {
    config: ServiceConfig,
    registry: Arc<BackendRegistry>,
    volumes: Arc<VolumeManager>,
    replication: Arc<FailoverCoordinator>,
    workers: WorkerPool,
    metrics: Arc<ServiceMetrics>,
    excluded: RwLock<BTreeMap<String, String>>,
    initialized: AtomicBool,
}

impl VolumeService {
    /// Build the service; backends are registered by [`initialize`](Self::initialize)
    pub fn new(config: ServiceConfig) -> Result<Arc<Self>> {
        let registry = BackendRegistry::new(RegistryConfig {
            refresh_interval: Duration::from_secs(config.registry.refresh_interval_secs),
            unreachable_after: config.registry.unreachable_after,
        });
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            SchedulerConfig {
                weigher: WeigherConfig {
                    capacity_weight: config.scheduler.capacity_weight,
                    load_weight: config.scheduler.load_weight,
                },
                max_attempts: config.scheduler.max_attempts,
            },
        ));
        let volumes = Arc::new(VolumeManager::new(
            registry.clone(),
            scheduler,
            Arc::new(ReplicationTable::new()),
            config.lock_mode,
        ));
        let replication = Arc::new(FailoverCoordinator::new(volumes.clone()));
        let workers = WorkerPool::new(WorkerConfig {
            max_concurrent: config.workers.max_concurrent,
        });

        Ok(Arc::new(Self {
            registry,
            volumes,
            replication,
            workers,
            metrics: Arc::new(ServiceMetrics::new()?),
            excluded: RwLock::new(BTreeMap::new()),
            initialized: AtomicBool::new(false),
            config,
        }))
    }

    /// Construct and register every enabled backend.
    ///
    /// A section that fails validation is excluded and logged; the other
    /// backends still start.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing volume service");

        for (name, section) in self.config.sections() {
            let result = match section {
                Ok(section) => self.register_backend(&section).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!("Backend {} excluded: {}", name, e);
                self.excluded.write().insert(name, e.to_string());
            }
        }

        let pairs = self.replication.register_pairs()?;
        info!(
            "Volume service initialized: {} backends, {} excluded, {} replication pairs",
            self.registry.len(),
            self.excluded.read().len(),
            pairs
        );
        if self.registry.is_empty() {
            warn!("No backends registered; every create will fail placement");
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            timeout: self.config.driver_call_timeout(),
            max_attempts: self.config.workers.driver_retry_attempts.max(1),
            initial_backoff: Duration::from_millis(self.config.workers.driver_retry_initial_ms),
            ..Default::default()
        }
    }

    async fn register_backend(&self, section: &BackendSection) -> Result<()> {
        let replication = section.replication_device()?;
        let (kind, driver) = BackendFactory::create(section).await?;
        let name = section.backend_name();
        let guarded = GuardedDriver::new(name.clone(), driver, self.call_policy());
        self.registry
            .register(name, kind, guarded, replication)
            .await
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn volumes(&self) -> &Arc<VolumeManager> {
        &self.volumes
    }

    pub fn replication(&self) -> &Arc<FailoverCoordinator> {
        &self.replication
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    pub fn excluded_backends(&self) -> BTreeMap<String, String> {
        self.excluded.read().clone()
    }

    /// Ready once initialized with at least one schedulable backend
    pub fn is_ready(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
            && self.registry.snapshot().iter().any(|b| b.is_schedulable())
    }

    // =========================================================================
    // Operation plumbing
    // =========================================================================

    /// Run `op` on the worker pool, keyed so one volume's jobs stay ordered
    async fn run<T, F, Fut>(&self, operation: &'static str, key: String, op: F) -> Result<T>
    where
        F: FnOnce(Arc<VolumeManager>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        debug!("Submitting {} on {}", operation, key);
        let job = op(self.volumes.clone());
        let result = self.workers.submit(key, job).join().await.and_then(|r| r);
        self.metrics
            .record_operation(operation, &result, started.elapsed().as_secs_f64());
        result
    }

    // =========================================================================
    // Volume operations
    // =========================================================================

    pub async fn create_volume(&self, request: CreateVolumeRequest) -> Result<Volume> {
        // The id is assigned inside the manager, so creates get a lane each
        let key = format!("create:{}", Uuid::new_v4());
        self.run("create_volume", key, move |m| async move {
            m.create_volume(request).await
        })
        .await
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let id = volume_id.to_string();
        self.run("delete_volume", id.clone(), move |m| async move {
            m.delete_volume(&id).await
        })
        .await
    }

    pub async fn extend_volume(&self, volume_id: &str, new_size_gb: u64) -> Result<Volume> {
        let id = volume_id.to_string();
        self.run("extend_volume", id.clone(), move |m| async move {
            m.extend_volume(&id, new_size_gb).await
        })
        .await
    }

    pub async fn retype_volume(&self, volume_id: &str, new_type: VolumeType) -> Result<Volume> {
        let id = volume_id.to_string();
        self.run("retype_volume", id.clone(), move |m| async move {
            m.retype_volume(&id, new_type).await
        })
        .await
    }

    pub async fn create_snapshot(&self, volume_id: &str) -> Result<Snapshot> {
        let id = volume_id.to_string();
        self.run("create_snapshot", id.clone(), move |m| async move {
            m.create_snapshot(&id).await
        })
        .await
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let parent = self.volumes.get_snapshot(snapshot_id)?.volume_id;
        let id = snapshot_id.to_string();
        self.run("delete_snapshot", parent, move |m| async move {
            m.delete_snapshot(&id).await
        })
        .await
    }

    pub async fn attach(&self, volume_id: &str, host: HostDescriptor) -> Result<Attachment> {
        let id = volume_id.to_string();
        self.run("attach", id.clone(), move |m| async move {
            m.attach(&id, host).await
        })
        .await
    }

    pub async fn detach(&self, volume_id: &str, host_name: &str) -> Result<()> {
        let id = volume_id.to_string();
        let host = host_name.to_string();
        self.run("detach", id.clone(), move |m| async move {
            m.detach(&id, &host).await
        })
        .await
    }

    pub async fn begin_backup(&self, volume_id: &str) -> Result<Volume> {
        let id = volume_id.to_string();
        self.run("begin_backup", id.clone(), move |m| async move {
            m.begin_backup(&id).await
        })
        .await
    }

    pub async fn complete_backup(&self, volume_id: &str, succeeded: bool) -> Result<Volume> {
        let id = volume_id.to_string();
        self.run("complete_backup", id.clone(), move |m| async move {
            m.complete_backup(&id, succeeded).await
        })
        .await
    }

    pub async fn begin_restore(&self, volume_id: &str) -> Result<Volume> {
        let id = volume_id.to_string();
        self.run("begin_restore", id.clone(), move |m| async move {
            m.begin_restore(&id).await
        })
        .await
    }

    pub async fn complete_restore(&self, volume_id: &str, succeeded: bool) -> Result<Volume> {
        let id = volume_id.to_string();
        self.run("complete_restore", id.clone(), move |m| async move {
            m.complete_restore(&id, succeeded).await
        })
        .await
    }

    pub fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        self.volumes.get_volume(volume_id)
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        self.volumes.list_volumes()
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.volumes.get_snapshot(snapshot_id)
    }

    pub fn list_snapshots(&self, volume_id: Option<&str>) -> Vec<Snapshot> {
        self.volumes.list_snapshots(volume_id)
    }

    // =========================================================================
    // Replication
    // =========================================================================

    pub async fn failover(&self, primary: &str, target: &str) -> Result<FailoverOutcome> {
        let result = self.replication.failover(primary, target).await;
        self.metrics.record_switch(primary, "failover", &result);
        result
    }

    pub async fn failback(&self, primary: &str) -> Result<FailoverOutcome> {
        let result = self.replication.failback(primary).await;
        self.metrics.record_switch(primary, "failback", &result);
        result
    }

    pub async fn reset_pair(&self, primary: &str) -> Result<PairEntry> {
        self.replication.reset_pair(primary).await
    }

    pub async fn replication_report(&self) -> Vec<PairReport> {
        self.replication.report().await
    }

    // =========================================================================
    // Background work
    // =========================================================================

    pub async fn reconcile_once(&self) -> ReconcileReport {
        let report = self.volumes.reconcile_once().await;
        self.metrics
            .record_reconcile(report.recovered, report.removed, report.failed);
        report
    }

    /// Push current registry and volume state into the gauges
    pub fn update_metrics(&self) {
        self.metrics.observe_backends(&self.registry.snapshot());
        self.metrics.observe_volumes(&self.volumes.status_counts());
    }

    /// Start refresh loops, the reconciler and the metrics updater
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = self.registry.spawn_refresh_loops(cancel.clone());

        let service = self.clone();
        let interval = Duration::from_secs(self.config.reconcile_interval_secs.max(1));
        let reconcile_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = reconcile_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        service.reconcile_once().await;
                        service.update_metrics();
                    }
                }
            }
        }));

        let service = self.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => service.update_metrics(),
                }
            }
        }));

        info!("Started {} background tasks", handles.len());
        handles
    }

    /// Stop accepting queued work
    pub fn shutdown(&self) {
        info!("Volume service shutting down");
        self.workers.close();
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self) -> ServiceStatus {
        let backends = self
            .registry
            .snapshot()
            .into_iter()
            .map(|b| BackendStatus {
                driver: b.kind.to_string(),
                health: b.health.label().to_string(),
                total_capacity_gb: b.report.as_ref().map(|r| r.total_capacity_gb),
                free_capacity_gb: b.report.as_ref().map(|r| r.free_capacity_gb),
                total_volumes: b.report.as_ref().map(|r| r.total_volumes),
                in_flight: b.in_flight,
                last_refresh: b.last_refresh,
                name: b.name,
            })
            .collect();
        let volumes_by_status = self
            .volumes
            .status_counts()
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();

        ServiceStatus {
            version: crate::VERSION.to_string(),
            ready: self.is_ready(),
            backends,
            excluded_backends: self.excluded_backends(),
            volumes_by_status,
            replication_pairs: self.replication.list_pairs(),
            workers: self.workers.stats(),
        }
    }

    /// Full invariant check across volumes and snapshots
    pub fn check_invariants(&self) -> Result<()> {
        self.volumes.check_invariants()
    }
}

impl std::fmt::Debug for VolumeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeService")
            .field("backends", &self.registry.names())
            .field("excluded", &self.excluded.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Convenience for callers that hold a config file path
pub async fn start_from_file(path: &str) -> Result<Arc<VolumeService>> {
    let config = ServiceConfig::load(path).map_err(|e| match e {
        Error::Io(io) => Error::invalid_config("*", format!("cannot read {}: {}", path, io)),
        other => other,
    })?;
    let service = VolumeService::new(config)?;
    service.initialize().await?;
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeStatus;
    use assert_matches::assert_matches;

    const CONFIG: &str = r#"
enabled_backends: [pool-a, pool-b, broken]
driver_call_timeout_secs: 5
backends:
  pool-a:
    volume_driver: memory
    san_ip: 10.0.1.10
    san_login: admin
    san_password: secret
    total_capacity_gb: 100
  pool-b:
    volume_driver: memory
    san_ip: 10.0.1.20
    san_login: admin
    san_password: secret
    total_capacity_gb: 400
    replication_device: "backend_id:replica-1,san_ip:10.0.2.10,san_login:admin,san_password:secret"
  broken:
    volume_driver: memory
    san_login: admin
"#;

    async fn service() -> Arc<VolumeService> {
        let config = ServiceConfig::from_yaml_str(CONFIG).unwrap();
        let service = VolumeService::new(config).unwrap();
        service.initialize().await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_bad_section_is_excluded() {
        let service = service().await;
        assert_eq!(service.registry().len(), 2);
        let excluded = service.excluded_backends();
        assert!(excluded.get("broken").unwrap().contains("san_ip"));
        assert!(service.is_ready());
        assert_eq!(service.replication().list_pairs().len(), 1);
    }

    #[tokio::test]
    async fn test_operations_are_counted() {
        let service = service().await;
        let volume = service
            .create_volume(CreateVolumeRequest::new("data", 10))
            .await
            .unwrap();
        // More free capacity wins
        assert_eq!(volume.backend.as_deref(), Some("pool-b"));
        assert_matches!(
            service.extend_volume(&volume.id, 5).await,
            Err(Error::InvalidRequest(_))
        );
        service.delete_volume(&volume.id).await.unwrap();

        service.update_metrics();
        let text = String::from_utf8(service.metrics().encode().unwrap().1).unwrap();
        assert!(text.contains("operation=\"create_volume\",outcome=\"ok\""));
        assert!(text.contains("outcome=\"invalid_request\""));

        let status = service.status();
        assert_eq!(status.volumes_by_status.get("deleted"), Some(&1));
        assert_eq!(status.workers.submitted, 3);
    }

    #[tokio::test]
    async fn test_backup_and_restore_run_on_the_volume_lane() {
        let service = service().await;
        let volume = service
            .create_volume(CreateVolumeRequest::new("data", 10))
            .await
            .unwrap();

        let backing_up = service.begin_backup(&volume.id).await.unwrap();
        assert_eq!(backing_up.status, VolumeStatus::BackingUp);
        assert_matches!(
            service.begin_restore(&volume.id).await,
            Err(Error::ConflictingOperation { .. })
        );
        let done = service.complete_backup(&volume.id, true).await.unwrap();
        assert_eq!(done.status, VolumeStatus::Available);

        service.begin_restore(&volume.id).await.unwrap();
        let restored = service.complete_restore(&volume.id, true).await.unwrap();
        assert_eq!(restored.status, VolumeStatus::Available);

        let text = String::from_utf8(service.metrics().encode().unwrap().1).unwrap();
        for operation in ["begin_backup", "complete_backup", "begin_restore", "complete_restore"] {
            assert!(text.contains(&format!("operation=\"{}\"", operation)));
        }
        assert_eq!(service.status().workers.submitted, 6);
    }
}
