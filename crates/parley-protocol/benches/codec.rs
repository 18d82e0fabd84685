//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::events::{PostRoomMessage, SendDirect};
use parley_protocol::{codec, ClientEvent, UserId};

fn room_message(len: usize) -> ClientEvent {
    ClientEvent::RoomMessage(PostRoomMessage {
        room_id: 7,
        content: "x".repeat(len),
    })
}

fn bench_text(c: &mut Criterion) {
    let event = room_message(64);
    let text = codec::encode_text(&event).unwrap();

    let mut group = c.benchmark_group("text");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("encode_64B", |b| {
        b.iter(|| codec::encode_text(black_box(&event)))
    });
    group.bench_function("decode_64B", |b| {
        b.iter(|| codec::decode_text::<ClientEvent>(black_box(&text)))
    });
    group.finish();
}

fn bench_binary(c: &mut Criterion) {
    let event = room_message(64);
    let encoded = codec::encode_binary(&event).unwrap();

    let mut group = c.benchmark_group("binary");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_64B", |b| {
        b.iter(|| codec::encode_binary(black_box(&event)))
    });
    group.bench_function("decode_64B", |b| {
        b.iter(|| codec::decode_binary::<ClientEvent>(black_box(&encoded)))
    });
    group.finish();
}

fn bench_rejection(c: &mut Criterion) {
    // Missing recipient: the decoder has to fail and keep the event name.
    let bad = r#"{"event":"dm:send","data":{"body":"hello"}}"#;
    let good = codec::encode_text(&ClientEvent::DmSend(SendDirect {
        recipient_user_id: UserId(2),
        body: Some("hello".into()),
        image_url: None,
    }))
    .unwrap();

    let mut group = c.benchmark_group("dm_send");
    group.bench_function("valid", |b| {
        b.iter(|| codec::decode_text::<ClientEvent>(black_box(&good)))
    });
    group.bench_function("invalid", |b| {
        b.iter(|| codec::decode_text::<ClientEvent>(black_box(bad)))
    });
    group.finish();
}

criterion_group!(benches, bench_text, bench_binary, bench_rejection);
criterion_main!(benches);
