//! End-to-end volume scenarios against simulated arrays

use assert_matches::assert_matches;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use volume_orchestrator::controlplane::backends::{
    CallPolicy, DriverOp, InjectedFault, MemoryDriver, MemoryDriverConfig,
};
use volume_orchestrator::controlplane::config::ReplicationDevice;
use volume_orchestrator::controlplane::start_from_file;
use volume_orchestrator::domain::model::{ReplicationMode, REPLICATION_SPEC};
use volume_orchestrator::replication::{PairState, ReplicationTable};
use volume_orchestrator::{
    BackendRegistry, CreateVolumeRequest, DriverKind, Error, FailoverCoordinator, GuardedDriver,
    HostDescriptor, LockMode, RegistryConfig, Scheduler, SchedulerConfig, VolumeManager,
    VolumeStatus, VolumeType,
};
use volume_orchestrator::volume::PROVISIONING_SPEC;

struct Harness {
    manager: Arc<VolumeManager>,
    coordinator: FailoverCoordinator,
    drivers: BTreeMap<String, Arc<MemoryDriver>>,
}

impl Harness {
    async fn new(configs: Vec<MemoryDriverConfig>) -> Self {
        let registry = BackendRegistry::new(RegistryConfig::default());
        let policy = CallPolicy {
            timeout: Duration::from_millis(250),
            max_attempts: 1,
            ..Default::default()
        };
        let mut drivers = BTreeMap::new();
        for config in configs {
            let name = config.backend_name.clone();
            let replication = config.replication.clone();
            let driver = Arc::new(MemoryDriver::new(config));
            registry
                .register(
                    name.clone(),
                    DriverKind::Memory,
                    GuardedDriver::new(name.clone(), driver.clone(), policy.clone()),
                    replication,
                )
                .await
                .unwrap();
            drivers.insert(name, driver);
        }
        let scheduler = Arc::new(Scheduler::new(registry.clone(), SchedulerConfig::default()));
        let manager = Arc::new(VolumeManager::new(
            registry,
            scheduler,
            Arc::new(ReplicationTable::new()),
            LockMode::Queue,
        ));
        let coordinator = FailoverCoordinator::new(manager.clone());
        coordinator.register_pairs().unwrap();
        Self {
            manager,
            coordinator,
            drivers,
        }
    }

    async fn single(total_capacity_gb: u64) -> Self {
        Self::new(vec![pool("pool-a", total_capacity_gb)]).await
    }

    fn driver(&self, name: &str) -> &Arc<MemoryDriver> {
        &self.drivers[name]
    }
}

fn pool(name: &str, total_capacity_gb: u64) -> MemoryDriverConfig {
    MemoryDriverConfig {
        backend_name: name.into(),
        total_capacity_gb,
        ..Default::default()
    }
}

fn replica_device() -> ReplicationDevice {
    ReplicationDevice {
        backend_id: "replica-1".into(),
        san_ip: "10.0.2.10".into(),
        san_login: "admin".into(),
        san_password: "secret".into(),
        mode: ReplicationMode::Async,
        rpo: Duration::from_secs(300),
        extra: BTreeMap::new(),
    }
}

fn host(name: &str) -> HostDescriptor {
    HostDescriptor::iscsi(name, format!("iqn.1994-05.com.redhat:{}", name))
}

#[tokio::test]
async fn placement_on_the_only_backend() {
    let harness = Harness::single(500).await;
    let volume = harness
        .manager
        .create_volume(CreateVolumeRequest::new("data", 100))
        .await
        .unwrap();
    assert_eq!(volume.backend.as_deref(), Some("pool-a"));
    assert_eq!(volume.status, VolumeStatus::Available);
    assert_eq!(volume.size_gb, 100);
}

#[tokio::test]
async fn thick_volume_larger_than_free_space_is_rejected() {
    let harness = Harness::single(50).await;
    let thick = VolumeType::new("thick").with_spec(PROVISIONING_SPEC, "thick");
    let result = harness
        .manager
        .create_volume(CreateVolumeRequest::new("big", 100).with_type(thick))
        .await;
    assert_matches!(result, Err(Error::NoValidBackend { .. }));
    assert_eq!(harness.driver("pool-a").calls(DriverOp::Create), 0);
    harness.manager.check_invariants().unwrap();
}

#[tokio::test]
async fn default_request_larger_than_free_space_is_rejected() {
    // Without over-subscription a default (thin) request needs its full size free
    let harness = Harness::new(vec![MemoryDriverConfig {
        max_over_subscription_ratio: 1.0,
        ..pool("pool-a", 50)
    }])
    .await;
    let report = harness.manager.registry().get("pool-a").unwrap().report.unwrap();
    assert_eq!(report.free_capacity_gb, 50.0);

    let result = harness
        .manager
        .create_volume(CreateVolumeRequest::new("big", 100))
        .await;
    assert_matches!(result, Err(Error::NoValidBackend { .. }));
    assert_eq!(harness.driver("pool-a").calls(DriverOp::Create), 0);
    harness.manager.check_invariants().unwrap();
}

#[tokio::test]
async fn clone_during_failover_waits_for_completion() {
    let harness = Harness::new(vec![MemoryDriverConfig {
        replication: Some(replica_device()),
        ..pool("pool-a", 500)
    }])
    .await;
    let replicated = VolumeType::new("replicated").with_spec(REPLICATION_SPEC, "<is> True");
    let source = harness
        .manager
        .create_volume(CreateVolumeRequest::new("db", 10).with_type(replicated.clone()))
        .await
        .unwrap();

    harness
        .driver("pool-a")
        .set_latency(DriverOp::Failover, Duration::from_millis(100));
    let manager = harness.manager.clone();
    let coordinator = FailoverCoordinator::new(manager.clone());
    // Pairs are shared through the manager's table
    assert_eq!(coordinator.list_pairs().len(), 1);
    let failover = tokio::spawn(async move { coordinator.failover("pool-a", "replica-1").await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let clone = CreateVolumeRequest::new("db-copy", 10)
        .with_type(replicated)
        .clone_of(source.id.clone());
    assert_matches!(
        harness.manager.create_volume(clone.clone()).await,
        Err(Error::FailoverInProgress { .. })
    );

    let outcome = failover.await.unwrap().unwrap();
    assert_eq!(outcome.active_backend_id.as_deref(), Some("replica-1"));
    assert!(!harness.coordinator.is_in_transition("pool-a"));
    assert_matches!(
        harness.coordinator.pair("pool-a").unwrap().state,
        PairState::FailedOver { ref target } if target == "replica-1"
    );

    let copy = harness.manager.create_volume(clone).await.unwrap();
    assert_eq!(copy.active_backend_id.as_deref(), Some("replica-1"));
    assert_eq!(copy.backend.as_deref(), Some("pool-a"));
    assert_eq!(harness.coordinator.list_pairs()[0].pair.active_backend_id(), Some("replica-1"));
}

#[tokio::test]
async fn extend_with_snapshot_on_restricted_backend() {
    let harness = Harness::new(vec![MemoryDriverConfig {
        supports_extend_with_snapshots: false,
        ..pool("pool-a", 500)
    }])
    .await;
    let volume = harness
        .manager
        .create_volume(CreateVolumeRequest::new("data", 10))
        .await
        .unwrap();
    harness.manager.create_snapshot(&volume.id).await.unwrap();

    assert_matches!(
        harness.manager.extend_volume(&volume.id, 20).await,
        Err(Error::HasSnapshots { .. })
    );
    let after = harness.manager.get_volume(&volume.id).unwrap();
    assert_eq!(after.size_gb, 10);
    assert_eq!(after.status, VolumeStatus::Available);
    assert_eq!(harness.driver("pool-a").calls(DriverOp::Extend), 0);
}

#[tokio::test]
async fn concurrent_deletes_reach_the_driver_once() {
    let harness = Harness::single(500).await;
    let volume = harness
        .manager
        .create_volume(CreateVolumeRequest::new("data", 10))
        .await
        .unwrap();
    harness
        .driver("pool-a")
        .set_latency(DriverOp::Delete, Duration::from_millis(50));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let manager = harness.manager.clone();
            let id = volume.id.clone();
            tokio::spawn(async move { manager.delete_volume(&id).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(harness.driver("pool-a").calls(DriverOp::Delete), 1);
    assert_eq!(
        harness.manager.get_volume(&volume.id).unwrap().status,
        VolumeStatus::Deleted
    );
}

#[tokio::test]
async fn snapshot_preserves_point_in_time_content() {
    let harness = Harness::single(500).await;
    let driver = harness.driver("pool-a");
    let volume = harness
        .manager
        .create_volume(CreateVolumeRequest::new("data", 1))
        .await
        .unwrap();
    let handle = volume.provider.clone().unwrap();
    driver.write(&handle, 0, b"before").unwrap();

    let snapshot = harness.manager.create_snapshot(&volume.id).await.unwrap();
    driver.write(&handle, 0, b"after!").unwrap();

    let restored = harness
        .manager
        .create_volume(CreateVolumeRequest::new("restored", 1).from_snapshot(snapshot.id.clone()))
        .await
        .unwrap();
    let restored_handle = restored.provider.clone().unwrap();
    assert_eq!(&driver.read(&restored_handle).unwrap()[..], b"before");
    assert_eq!(&driver.read(&handle).unwrap()[..], b"after!");

    // The restored volume does not pin the snapshot
    harness.manager.delete_snapshot(&snapshot.id).await.unwrap();
    harness.manager.delete_volume(&volume.id).await.unwrap();
    harness.manager.check_invariants().unwrap();
}

#[tokio::test]
async fn detach_is_idempotent() {
    let harness = Harness::single(500).await;
    let volume = harness
        .manager
        .create_volume(CreateVolumeRequest::new("data", 10))
        .await
        .unwrap();
    harness.manager.attach(&volume.id, host("c1")).await.unwrap();
    assert_eq!(
        harness.manager.get_volume(&volume.id).unwrap().status,
        VolumeStatus::InUse
    );

    harness.manager.detach(&volume.id, "c1").await.unwrap();
    harness.manager.detach(&volume.id, "c1").await.unwrap();
    let after = harness.manager.get_volume(&volume.id).unwrap();
    assert_eq!(after.status, VolumeStatus::Available);
    assert!(after.attachments.is_empty());
    assert_eq!(harness.driver("pool-a").calls(DriverOp::Detach), 1);
}

#[tokio::test]
async fn timed_out_create_is_recovered_by_reconcile() {
    let harness = Harness::single(500).await;
    harness
        .driver("pool-a")
        .inject(DriverOp::Create, InjectedFault::ApplyThenHang);

    let result = harness
        .manager
        .create_volume(CreateVolumeRequest::new("data", 10))
        .await;
    assert_matches!(result, Err(Error::DriverTimeout { .. }));

    let volumes = harness.manager.list_volumes();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].status, VolumeStatus::Error);
    assert!(volumes[0].needs_verification());

    let report = harness.manager.reconcile_once().await;
    assert_eq!(report.recovered, 1);
    let recovered = harness.manager.get_volume(&volumes[0].id).unwrap();
    assert_eq!(recovered.status, VolumeStatus::Available);
    assert!(!recovered.needs_verification());
    harness.manager.check_invariants().unwrap();
}

#[tokio::test]
async fn service_starts_with_one_bad_backend_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    std::fs::create_dir_all(&images).unwrap();
    let config = format!(
        r#"
driver_call_timeout_secs: 5
lock_mode: queue
backends:
  pool-a:
    volume_driver: memory
    san_ip: 10.0.1.10
    san_login: admin
    san_password: secret
    total_capacity_gb: 200
  nfs-1:
    volume_driver: file
    volumes_dir: {}
    total_capacity_gb: 50
  broken:
    volume_driver: memory
    san_ip: 10.0.1.30
    san_login: admin
    san_password: secret
    reserved_percentage: 150
"#,
        images.display()
    );
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, config).unwrap();

    let service = start_from_file(path.to_str().unwrap()).await.unwrap();
    assert_eq!(service.registry().len(), 2);
    assert!(service.excluded_backends().contains_key("broken"));
    assert!(service.is_ready());

    let nfs = VolumeType::new("nfs").with_spec("volume_backend_name", "nfs-1");
    let volume = tokio_test::assert_ok!(
        service
            .create_volume(CreateVolumeRequest::new("share", 5).with_type(nfs))
            .await
    );
    assert_eq!(volume.backend.as_deref(), Some("nfs-1"));

    tokio_test::assert_ok!(service.delete_volume(&volume.id).await);
    let status = service.status();
    assert_eq!(status.backends.len(), 2);
    assert_eq!(status.volumes_by_status.get("deleted"), Some(&1));
    service.check_invariants().unwrap();
}
