//! Fan-out benchmarks for the connection hub and presence registry.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parley_core::{ConnectionId, Hub, ManualClock, PresenceRegistry};
use parley_protocol::events::{Heartbeat, ServerEvent};
use parley_protocol::UserId;
use std::sync::Arc;

/// Benchmark one event enqueued for many connections.
fn bench_hub_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("hub_fanout");

    for size in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let hub = Hub::new(1);
            let targets: Vec<_> = (0..size).map(|i| ConnectionId::new(format!("conn-{i}"))).collect();
            let mut receivers: Vec<_> = targets
                .iter()
                .enumerate()
                .map(|(i, conn)| hub.register(conn.clone(), UserId(i as u64)))
                .collect();
            let event = Arc::new(ServerEvent::Pong(Heartbeat::default()));

            b.iter(|| {
                hub.fan_out(&targets, black_box(Arc::clone(&event)));
                for rx in &mut receivers {
                    let _ = rx.try_recv();
                }
            });
        });
    }

    group.finish();
}

/// Benchmark presence transitions for a user with several tabs open.
fn bench_presence(c: &mut Criterion) {
    let mut group = c.benchmark_group("presence");
    let presence = PresenceRegistry::new(Arc::new(ManualClock::new(0)));
    let user = UserId(1);
    let tabs: Vec<_> = (0..8).map(|i| ConnectionId::new(format!("tab-{i}"))).collect();

    group.bench_function("open_close_8_tabs", |b| {
        b.iter(|| {
            for tab in &tabs {
                black_box(presence.connection_opened(user, tab.clone()));
            }
            for tab in &tabs {
                black_box(presence.connection_closed(user, tab));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_hub_fanout, bench_presence);
criterion_main!(benches);
