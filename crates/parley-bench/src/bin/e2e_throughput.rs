//! End-to-end throughput benchmark for Parley.
//!
//! Connects many WebSocket clients to a running server, joins them all to
//! the default room and measures how many `message_received` events arrive
//! per second.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{codec, ClientEvent, ServerEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "e2e_throughput")]
#[command(about = "End-to-end room message throughput against a running server", long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short = 'n', long, default_value_t = 16)]
    clients: usize,

    /// WebSocket endpoint of the server
    #[arg(short = 'u', long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,

    /// Warmup duration in seconds
    #[arg(long, default_value_t = 2)]
    warmup: u64,

    /// Measurement duration in seconds
    #[arg(long, default_value_t = 10)]
    duration: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Parley End-to-End Throughput Benchmark               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_room_benchmark(&args).await;
}

async fn run_room_benchmark(args: &Args) {
    println!("📊 Room Broadcast Benchmark: {} clients", args.clients);
    println!(
        "   Warmup: {}s, Measurement: {}s",
        args.warmup, args.duration
    );
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(args.clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..args.clients {
        let received = Arc::clone(&received);
        let barrier = Arc::clone(&barrier);
        let url = args.url.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &url, received, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("✓ All {} clients joined", args.clients);

    println!("⏳ Warming up for {}s...", args.warmup);
    tokio::time::sleep(Duration::from_secs(args.warmup)).await;

    received.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", args.duration);
    tokio::time::sleep(Duration::from_secs(args.duration)).await;

    let elapsed = start.elapsed();
    let total = received.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Clients:              {:>10}                            ║", args.clients);
    println!("║  Duration:             {:>10.2}s                           ║", elapsed.as_secs_f64());
    println!("║  Messages Delivered:   {:>10}                            ║", total);
    println!("║  Throughput:           {:>10.0} msg/s                      ║", per_sec);
    println!(
        "║  Per-Client:           {:>10.0} msg/s                      ║",
        per_sec / args.clients as f64
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    let join = codec::encode_json(&ClientEvent::join(format!("bench{client_id:04}")))?;
    sender.send(Message::Text(join)).await?;

    // The join is complete once our history page arrives.
    while let Some(message) = receiver.next().await {
        if let Message::Text(text) = message? {
            if matches!(
                codec::decode_json::<ServerEvent>(&text)?,
                ServerEvent::RoomHistory { .. }
            ) {
                break;
            }
        }
    }

    barrier.wait().await;

    let send = Message::Text(codec::encode_json(&ClientEvent::send("benchmark payload"))?);

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Text(text) = message {
                if let Ok(ServerEvent::MessageReceived { .. }) = codec::decode_json(&text) {
                    received.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    loop {
        if sender.send(send.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
