//! Allocator throughput benchmarks
//!
//! Compares allocate+release cost across cluster sizes and port-requirement
//! counts, backed by the in-memory `Store` so the benchmark measures the
//! allocator's own locking/selection cost rather than network or disk I/O.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gamehost_control_plane::allocator::Allocator;
use gamehost_control_plane::store::memory::MemoryStore;
use gamehost_control_plane::store::models::PortRequirement;
use gamehost_control_plane::types::{NodeName, Protocol, ResourceRequirement, ServerId};
use std::sync::Arc;

fn port_requirements(count: usize) -> Vec<PortRequirement> {
    (0..count)
        .map(|i| PortRequirement { port_name: format!("port-{i}"), protocol: Protocol::Udp })
        .collect()
}

fn build_cluster(rt: &tokio::runtime::Runtime, node_count: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    rt.block_on(async {
        for i in 0..node_count {
            let node = NodeName::from(format!("node-{i}"));
            store.upsert_node(&node, "203.0.113.1", 16_000, 32_000_000_000).await.unwrap();
            store.initialize_node_ports(&node, 25500, 26500).await.unwrap();
        }
    });
    store
}

fn bench_allocate_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("allocate_release");

    for node_count in [1, 10, 50].iter() {
        let store = build_cluster(&rt, *node_count);
        let allocator = Allocator::new(store, 0.90);
        let requirements = port_requirements(2);

        group.bench_with_input(BenchmarkId::new("nodes", node_count), node_count, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let server_id = ServerId::new();
                    let allocation = allocator
                        .allocate(server_id, &requirements, ResourceRequirement::new(500, 512_000_000))
                        .await
                        .unwrap();
                    black_box(&allocation);
                    allocator.release(server_id).await.unwrap();
                });
            });
        });
    }

    group.finish();
}

fn bench_has_capacity(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = build_cluster(&rt, 50);
    let allocator = Allocator::new(store, 0.90);

    c.bench_function("has_capacity_probe", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(allocator.has_capacity(ResourceRequirement::new(500, 512_000_000)).await.unwrap());
            });
        });
    });
}

criterion_group!(benches, bench_allocate_release, bench_has_capacity);
criterion_main!(benches);
