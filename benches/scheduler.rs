//! Benchmark for filter-weigher placement
//!
//! Ranks a registry snapshot of simulated backends the way every create does.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeMap;
use std::sync::Arc;
use volume_orchestrator::controlplane::backends::{CallPolicy, MemoryDriver, MemoryDriverConfig};
use volume_orchestrator::scheduler::PlacementRequest;
use volume_orchestrator::{
    Backend, BackendRegistry, DriverKind, GuardedDriver, RegistryConfig, Scheduler,
    SchedulerConfig,
};

fn backends(count: usize) -> (Arc<BackendRegistry>, Vec<Backend>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let registry = BackendRegistry::new(RegistryConfig::default());
    runtime.block_on(async {
        for i in 0..count {
            let name = format!("pool-{:03}", i);
            let driver = Arc::new(MemoryDriver::new(MemoryDriverConfig {
                backend_name: name.clone(),
                total_capacity_gb: 1000 + (i as u64 * 37) % 4000,
                compression_support: i % 3 == 0,
                ..Default::default()
            }));
            registry
                .register(
                    name.clone(),
                    DriverKind::Memory,
                    GuardedDriver::new(name, driver, CallPolicy::default()),
                    None,
                )
                .await
                .unwrap();
        }
    });
    let snapshot = registry.snapshot();
    (registry, snapshot)
}

fn bench_rank(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");

    for count in [8usize, 64, 512] {
        let (registry, snapshot) = backends(count);
        let scheduler = Scheduler::new(registry, SchedulerConfig::default());
        let request = PlacementRequest {
            size_gb: 100,
            thin: true,
            ..Default::default()
        };

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("rank", count), &snapshot, |b, snapshot| {
            b.iter(|| scheduler.rank(black_box(snapshot), black_box(&request)))
        });
    }

    group.finish();
}

fn bench_rank_with_specs(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");
    let (registry, snapshot) = backends(64);
    let scheduler = Scheduler::new(registry, SchedulerConfig::default());

    let mut extra_specs = BTreeMap::new();
    extra_specs.insert("capabilities:compression_support".to_string(), "<is> True".to_string());
    extra_specs.insert("capabilities:vendor_name".to_string(), "Simulated".to_string());
    let request = PlacementRequest {
        size_gb: 250,
        extra_specs,
        thin: true,
        ..Default::default()
    };

    group.bench_function("rank_with_extra_specs", |b| {
        b.iter(|| scheduler.rank(black_box(&snapshot), black_box(&request)))
    });

    group.finish();
}

criterion_group!(benches, bench_rank, bench_rank_with_specs);
criterion_main!(benches);
