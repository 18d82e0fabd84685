//! End-to-end throughput benchmark for Parley.
//!
//! Pairs of clients exchange direct messages over real WebSocket connections.
//! The server must run with `auth.mode = "passthrough"`.

use futures_util::{SinkExt, StreamExt};
use parley_protocol::events::{ClientEvent, ServerEvent};
use parley_protocol::{codec, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let pairs = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8);

    println!("Parley end-to-end throughput benchmark");
    println!("Make sure the server is running: cargo run --release --bin parley");
    println!();

    run_direct_benchmark(pairs).await;
}

async fn run_direct_benchmark(pairs: usize) {
    let clients = pairs * 2;
    println!("Direct message benchmark: {pairs} pairs ({clients} clients)");
    println!("   Warmup: {WARMUP_SECS}s, Measurement: {BENCH_SECS}s");
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(clients + 1));

    let mut handles = Vec::new();
    for pair in 0..pairs {
        // Passthrough auth maps a subject to the same user on every connect, so
        // each side can learn its partner's id from a throwaway handshake.
        let left = format!("e2e-{pair}-a");
        let right = format!("e2e-{pair}-b");
        let (left_id, right_id) = match (user_id_of(&left).await, user_id_of(&right).await) {
            (Ok(l), Ok(r)) => (l, r),
            (Err(e), _) | (_, Err(e)) => {
                eprintln!("Handshake failed: {e}");
                return;
            }
        };

        for (subject, partner) in [(left, right_id), (right, left_id)] {
            let count = Arc::clone(&message_count);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                if let Err(e) = run_client(&subject, partner, count, barrier).await {
                    eprintln!("Client {subject} error: {e}");
                }
            }));
        }
    }

    barrier.wait().await;
    println!("All {clients} clients connected");

    println!("Warming up for {WARMUP_SECS}s...");
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring for {BENCH_SECS}s...");
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);
    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results");
    println!("  Clients:          {clients:>10}");
    println!("  Duration:         {:>10.2}s", elapsed.as_secs_f64());
    println!("  Messages received:{total_messages:>10}");
    println!("  Throughput:       {msgs_per_sec:>10.0} msg/s");
    println!("  Per client:       {:>10.0} msg/s", msgs_per_sec / clients as f64);

    for handle in handles {
        handle.abort();
    }
}

async fn user_id_of(subject: &str) -> Result<UserId, BoxError> {
    let (mut ws, _) = connect_async(format!("{SERVER_URL}?token={subject}")).await?;
    let id = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if let ServerEvent::Ready(ready) = codec::decode_text::<ServerEvent>(&text)? {
                    break ready.user_id;
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err("connection closed before ready".into()),
        }
    };
    ws.close(None).await?;
    Ok(id)
}

async fn run_client(
    subject: &str,
    partner: UserId,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(format!("{SERVER_URL}?token={subject}")).await?;
    let (mut sender, mut receiver) = ws.split();

    barrier.wait().await;

    let request = ClientEvent::DmSend(parley_bench::direct_to(partner, 64));
    let frame = Message::Text(codec::encode_text(&request)?);

    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(text)) = result {
                if let Ok(ServerEvent::DmMessage(message)) = codec::decode_text(&text) {
                    if message.recipient_user_id != partner {
                        message_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    loop {
        if sender.send(frame.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
