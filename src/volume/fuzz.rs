//! Randomized operation sequences against the volume state machine.
//!
//! Every sequence runs against a memory array with scripted faults; after
//! each step the record-level invariants must hold, whatever the step
//! returned.

use super::{CreateVolumeRequest, LockMode, VolumeManager, VolumeStatus};
use crate::controlplane::backends::{
    CallPolicy, DriverKind, DriverOp, GuardedDriver, InjectedFault, MemoryDriver,
    MemoryDriverConfig,
};
use crate::domain::model::{VolumeType, MULTIATTACH_SPEC};
use crate::domain::ports::HostDescriptor;
use crate::registry::{BackendRegistry, RegistryConfig};
use crate::replication::ReplicationTable;
use crate::scheduler::{Scheduler, SchedulerConfig};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Step {
    Create { size_gb: u64, shared: bool },
    Delete(usize),
    Extend(usize, u64),
    Snapshot(usize),
    DeleteSnapshot(usize),
    Attach(usize, u8),
    Detach(usize, u8),
    Backup(usize, bool),
    Reconcile,
    Fault(usize, usize),
}

const OPS: [DriverOp; 6] = [
    DriverOp::Create,
    DriverOp::Delete,
    DriverOp::Extend,
    DriverOp::Attach,
    DriverOp::Detach,
    DriverOp::Snapshot,
];

fn fault(index: usize) -> InjectedFault {
    match index % 3 {
        0 => InjectedFault::Unavailable,
        1 => InjectedFault::Failed("scripted".into()),
        _ => InjectedFault::ApplyThenHang,
    }
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1u64..50, any::<bool>()).prop_map(|(size_gb, shared)| Step::Create { size_gb, shared }),
        any::<usize>().prop_map(Step::Delete),
        (any::<usize>(), 1u64..20).prop_map(|(i, by)| Step::Extend(i, by)),
        any::<usize>().prop_map(Step::Snapshot),
        any::<usize>().prop_map(Step::DeleteSnapshot),
        (any::<usize>(), 0u8..3).prop_map(|(i, h)| Step::Attach(i, h)),
        (any::<usize>(), 0u8..3).prop_map(|(i, h)| Step::Detach(i, h)),
        (any::<usize>(), any::<bool>()).prop_map(|(i, ok)| Step::Backup(i, ok)),
        Just(Step::Reconcile),
        (0usize..OPS.len(), 0usize..3).prop_map(|(op, f)| Step::Fault(op, f)),
    ]
}

async fn setup() -> (VolumeManager, Arc<MemoryDriver>) {
    let registry = BackendRegistry::new(RegistryConfig::default());
    let driver = Arc::new(MemoryDriver::new(MemoryDriverConfig {
        backend_name: "pool-a".into(),
        total_capacity_gb: 400,
        max_snapshots_per_volume: 2,
        ..Default::default()
    }));
    let policy = CallPolicy {
        timeout: Duration::from_millis(10),
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
    (manager, driver)
}

fn pick<T: Clone>(items: &[T], index: usize) -> Option<T> {
    if items.is_empty() {
        None
    } else {
        Some(items[index % items.len()].clone())
    }
}

fn host(index: u8) -> HostDescriptor {
    let name = format!("compute-{}", index);
    HostDescriptor::iscsi(name.clone(), format!("iqn.1994-05.com.redhat:{}", name))
}

async fn apply(manager: &VolumeManager, driver: &MemoryDriver, step: Step) {
    let volumes = manager.list_volumes();
    let snapshots = manager.list_snapshots(None);
    // Outcomes are ignored; only the resulting records are checked
    match step {
        Step::Create { size_gb, shared } => {
            let mut request = CreateVolumeRequest::new("prop", size_gb);
            if shared {
                request = request
                    .with_type(VolumeType::new("shared").with_spec(MULTIATTACH_SPEC, "<is> True"));
            }
            let _ = manager.create_volume(request).await;
        }
        Step::Delete(i) => {
            if let Some(v) = pick(&volumes, i) {
                let _ = manager.delete_volume(&v.id).await;
            }
        }
        Step::Extend(i, by) => {
            if let Some(v) = pick(&volumes, i) {
                let _ = manager.extend_volume(&v.id, v.size_gb + by).await;
            }
        }
        Step::Snapshot(i) => {
            if let Some(v) = pick(&volumes, i) {
                let _ = manager.create_snapshot(&v.id).await;
            }
        }
        Step::DeleteSnapshot(i) => {
            if let Some(s) = pick(&snapshots, i) {
                let _ = manager.delete_snapshot(&s.id).await;
            }
        }
        Step::Attach(i, h) => {
            if let Some(v) = pick(&volumes, i) {
                let _ = manager.attach(&v.id, host(h)).await;
            }
        }
        Step::Detach(i, h) => {
            if let Some(v) = pick(&volumes, i) {
                let _ = manager.detach(&v.id, &host(h).host).await;
            }
        }
        Step::Backup(i, succeeded) => {
            if let Some(v) = pick(&volumes, i) {
                if manager.begin_backup(&v.id).await.is_ok() {
                    let _ = manager.complete_backup(&v.id, succeeded).await;
                }
            }
        }
        Step::Reconcile => {
            manager.reconcile_once().await;
        }
        Step::Fault(op, f) => driver.inject(OPS[op], fault(f)),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn invariants_hold_under_random_operations(steps in prop::collection::vec(step(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (manager, driver) = setup().await;
            // Backend recorded once a volume leaves `creating`
            let mut placed: BTreeMap<String, Option<String>> = BTreeMap::new();
            for step in steps {
                apply(&manager, &driver, step.clone()).await;
                if let Err(e) = manager.check_invariants() {
                    panic!("after {:?}: {}", step, e);
                }
                for volume in manager.list_volumes() {
                    assert!(
                        !volume.status.is_transitional(),
                        "volume {} left {} after {:?}",
                        volume.id,
                        volume.status,
                        step
                    );
                    if volume.status == VolumeStatus::Creating {
                        continue;
                    }
                    let backend = placed
                        .entry(volume.id.clone())
                        .or_insert_with(|| volume.backend.clone());
                    assert_eq!(
                        *backend, volume.backend,
                        "volume {} moved backend after {:?}",
                        volume.id, step
                    );
                }
            }
        });
    }

    #[test]
    fn deleted_volumes_stay_deleted(steps in prop::collection::vec(step(), 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (manager, driver) = setup().await;
            let mut deleted = std::collections::BTreeSet::new();
            for step in steps {
                apply(&manager, &driver, step).await;
                for volume in manager.list_volumes() {
                    if deleted.contains(&volume.id) {
                        assert_eq!(volume.status, VolumeStatus::Deleted);
                    }
                    if volume.status == VolumeStatus::Deleted {
                        deleted.insert(volume.id);
                    }
                }
            }
        });
    }
}
