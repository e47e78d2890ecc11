//! Benchmarks for the entry table and the reconciliation engine
//!
//! Covers the per-message hot path (owner add/remove) and departure cleanup
//! of a node that owns many entries.

use bytes::Bytes;
use cluster_state_registry::domain::{ClusterTransport, MembershipEvent, NodeId};
use cluster_state_registry::registry::{EntryTable, Notifier, ReconciliationEngine, RegistryMetrics};
use cluster_state_registry::sync::Publisher;
use cluster_state_registry::Result;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Transport that discards everything it is asked to publish
struct NullTransport {
    local: NodeId,
}

impl ClusterTransport for NullTransport {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    fn peers(&self) -> Vec<NodeId> {
        Vec::new()
    }

    fn publish(&self, _topic: &str, _payload: Bytes) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self, _topic: &str) -> mpsc::UnboundedReceiver<Bytes> {
        mpsc::unbounded_channel().1
    }

    fn membership(&self) -> broadcast::Receiver<MembershipEvent> {
        broadcast::channel(1).1
    }
}

fn engine() -> ReconciliationEngine {
    let local = NodeId::new("bench-local");
    let transport = Arc::new(NullTransport {
        local: local.clone(),
    });
    ReconciliationEngine::new(
        local,
        Publisher::new(transport, "bench"),
        Notifier::new(1024),
        Arc::new(RegistryMetrics::new()),
    )
}

fn bench_table_add_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry_table");
    group.throughput(Throughput::Elements(1));

    let nodes: Vec<NodeId> = (0..16).map(|i| NodeId::new(format!("node-{i:02}"))).collect();
    let names: Vec<String> = (0..1000).map(|i| format!("entry-{i:04}")).collect();

    group.bench_function("add_owner", |b| {
        let mut table = EntryTable::new();
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let name = &names[counter % names.len()];
            let node = &nodes[counter % nodes.len()];
            black_box(table.add_owner(black_box(name), node));
        });
    });

    group.bench_function("add_then_remove_owner", |b| {
        let mut table = EntryTable::new();
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let name = &names[counter % names.len()];
            let node = &nodes[counter % nodes.len()];
            table.add_owner(name, node);
            black_box(table.remove_owner(black_box(name), node));
        });
    });

    group.finish();
}

fn bench_remote_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconciliation_engine");
    group.throughput(Throughput::Elements(1));

    let engine = engine();
    let origin = NodeId::new("remote");
    let names: Vec<String> = (0..1000).map(|i| format!("entry-{i:04}")).collect();

    group.bench_function("apply_remote_add_remove", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let name = &names[counter % names.len()];
            engine.apply_remote_add(black_box(name), &origin);
            engine.apply_remote_remove(black_box(name), &origin);
        });
    });

    group.bench_function("apply_local_add", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            engine.apply_local_add(black_box(&names[counter % names.len()]));
        });
    });

    group.finish();
}

fn bench_departure_cleanup(c: &mut Criterion) {
    let mut group = c.benchmark_group("departure_cleanup");
    let departed = NodeId::new("departed");
    let survivor = NodeId::new("survivor");

    for owned in [100usize, 10_000] {
        group.throughput(Throughput::Elements(owned as u64));
        group.bench_function(format!("remove_node_{owned}"), |b| {
            b.iter_batched(
                || {
                    let engine = engine();
                    for i in 0..owned {
                        let name = format!("entry-{i:05}");
                        engine.apply_remote_add(&name, &departed);
                        if i % 2 == 0 {
                            engine.apply_remote_add(&name, &survivor);
                        }
                    }
                    engine
                },
                |engine| black_box(engine.remove_node(&departed)),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_table_add_remove,
    bench_remote_messages,
    bench_departure_cleanup,
);
criterion_main!(benches);
