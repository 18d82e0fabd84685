//! Throughput benchmarks for the Parley engine.
//!
//! These benchmarks measure intent handling without any network I/O.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_bench::{connected_engine, crowded_room, direct_to, drain, runtime};
use parley_protocol::events::PostRoomMessage;
use parley_protocol::{codec, ClientEvent};

/// Benchmark direct message sends between two online users.
fn bench_direct(c: &mut Criterion) {
    let rt = runtime();
    let (engine, mut leases) = rt.block_on(connected_engine(2));
    let recipient = leases[1].session.user_id();
    let sender = leases[0].session.user_id();

    let mut group = c.benchmark_group("direct");
    group.throughput(Throughput::Elements(1));

    group.bench_function("send_64B", |b| {
        b.iter(|| {
            rt.block_on(engine.direct().send(sender, black_box(direct_to(recipient, 64))))
                .unwrap();
            for lease in &mut leases {
                drain(&mut lease.events);
            }
        });
    });

    group.bench_function("list_page_20", |b| {
        b.iter(|| {
            rt.block_on(engine.direct().list_page(
                recipient,
                sender,
                parley_core::PageQuery::new(1, 20),
            ))
            .unwrap()
        });
    });

    group.finish();
}

/// Benchmark room posts with a full room of listeners.
fn bench_room(c: &mut Criterion) {
    let rt = runtime();
    let (engine, mut leases) = rt.block_on(connected_engine(50));
    let room = rt.block_on(crowded_room(&engine, &leases));
    let author = leases[0].session.user_id();

    let mut group = c.benchmark_group("room");
    group.throughput(Throughput::Elements(leases.len() as u64));

    group.bench_function("post_50_members", |b| {
        b.iter(|| {
            rt.block_on(engine.rooms().post_message(author, room, black_box("hello room")))
                .unwrap();
            for lease in &mut leases {
                drain(&mut lease.events);
            }
        });
    });

    group.finish();
}

/// Benchmark the decode + dispatch path for a text frame.
fn bench_dispatch(c: &mut Criterion) {
    let rt = runtime();
    let (engine, mut leases) = rt.block_on(connected_engine(10));
    let room = rt.block_on(crowded_room(&engine, &leases));
    let frame = codec::encode_text(&ClientEvent::RoomMessage(PostRoomMessage {
        room_id: room,
        content: "dispatched".into(),
    }))
    .unwrap();

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Bytes(frame.len() as u64));

    group.bench_function("text_room_message", |b| {
        b.iter(|| {
            let event = codec::decode_text::<ClientEvent>(black_box(&frame));
            rt.block_on(engine.dispatch_frame(&leases[0].session, event))
                .unwrap();
            for lease in &mut leases {
                drain(&mut lease.events);
            }
        });
    });

    group.bench_function("malformed", |b| {
        b.iter(|| {
            let event = codec::decode_text::<ClientEvent>(black_box("{\"event\":"));
            let _ = rt.block_on(engine.dispatch_frame(&leases[0].session, event));
            drain(&mut leases[0].events);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_direct, bench_room, bench_dispatch);
criterion_main!(benches);
