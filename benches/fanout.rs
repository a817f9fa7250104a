//! Performance benchmarks for fanout dispatch and binding creation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use crossbeam_channel::{bounded, Receiver};
use serde_json::json;
use std::sync::Arc;
use subscription_broker::{
    AuthUser, Broker, BrokerConfig, ClientId, FanoutConfig, InMemoryCore, UpdateEnvelope,
};
use tempfile::TempDir;

fn in_memory_broker(fanout: FanoutConfig) -> (Broker, Arc<InMemoryCore>) {
    let core = Arc::new(InMemoryCore::new());
    let config = BrokerConfig {
        fanout,
        ..Default::default()
    };
    (Broker::in_memory(config, core.clone()), core)
}

/// Benchmark one update fanned out to a growing number of clients
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    for clients in [1u64, 10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("clients", clients),
            &clients,
            |b, &clients| {
                let (broker, _core) = in_memory_broker(FanoutConfig {
                    send_timeout_ms: 0,
                    ..Default::default()
                });
                let router = broker.router();

                let receivers: Vec<Receiver<_>> = (0..clients)
                    .map(|i| {
                        let (tx, rx) = bounded(1024);
                        router.attach(ClientId(i), "bench-entity", tx).unwrap();
                        rx
                    })
                    .collect();

                let envelope = UpdateEnvelope::new(
                    "bench-entity@realtime",
                    json!({"temperature": 21.5, "humidity": 40}),
                );

                b.iter(|| {
                    black_box(router.dispatch(&envelope).unwrap());
                    for rx in &receivers {
                        while rx.try_recv().is_ok() {}
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark create-then-delete of a binding against a persisted store
fn bench_binding_cycle(c: &mut Criterion) {
    c.bench_function("binding_cycle", |b| {
        let dir = TempDir::new().unwrap();
        let core = Arc::new(InMemoryCore::new());
        core.add_entity("device");
        let mut config = BrokerConfig::default();
        config.store.path = dir.path().join("broker");
        let broker = Broker::open(config, core).unwrap();

        let user = AuthUser::new("bench", "tenant");
        let sub = broker
            .engine()
            .create_subscription(&user, "Bench", "")
            .unwrap();

        b.iter(|| {
            broker
                .engine()
                .create_binding(&user, sub.id, "device")
                .unwrap();
            broker
                .engine()
                .delete_binding(&user, sub.id, "device")
                .unwrap();
        });
    });
}

criterion_group!(benches, bench_dispatch, bench_binding_cycle);
criterion_main!(benches);
