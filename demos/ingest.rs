//! Minimal gateway over in-memory storage, with one simulated tracker.
//!
//! Run with `cargo run --example ingest`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use trackgate::commands::CommandCache;
use trackgate::directory::DeviceDirectory;
use trackgate::geo::{identity_transform, NullCellLocator};
use trackgate::pipeline;
use trackgate::protocol::{GatewayContext, ProtocolRegistry};
use trackgate::queue::BoundedQueue;
use trackgate::server;
use trackgate::session::SessionConfig;
use trackgate::stats::GatewayStats;
use trackgate::storage::{MemoryStorage, Storage};
use trackgate::vendors::{Atr805Protocol, EworldProtocol};

#[tokio::main]
async fn main() -> trackgate::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("trackgate=debug")
        .init();

    let memory = Arc::new(MemoryStorage::new());
    memory.push_device("42", "WORLD2020916012");
    let storage: Arc<dyn Storage> = memory.clone();

    let stats = Arc::new(GatewayStats::new());
    let ctx = Arc::new(GatewayContext {
        directory: Arc::new(DeviceDirectory::new(storage.clone())),
        commands: Arc::new(CommandCache::new(storage.clone())),
        storage: storage.clone(),
        stats: stats.clone(),
        transform: identity_transform,
        cells: Arc::new(NullCellLocator),
    });

    let mut registry = ProtocolRegistry::new();
    registry.register(Arc::new(EworldProtocol));
    registry.register(Arc::new(Atr805Protocol));

    let persistence = Arc::new(BoundedQueue::new(1024));
    pipeline::spawn_persistence_pool(persistence.clone(), storage, stats, 2);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(server::run_tcp_server(
        listener,
        Arc::new(registry),
        ctx,
        persistence,
        SessionConfig::default(),
    ));
    println!("gateway listening on {addr}");

    // Simulated tracker: one position report, then read the ack.
    let mut device = TcpStream::connect(addr).await?;
    let now = Utc::now();
    let sentence = format!(
        "*HQ,2020916012,V1,{},A,3015.5000,N,12030.0000,E,10,90,{},FFFFFFFF,5#",
        now.format("%H%M%S"),
        now.format("%d%m%y"),
    );
    device.write_all(sentence.as_bytes()).await?;
    println!("device sent: {sentence}");

    let mut buf = vec![0u8; 256];
    let n = device.read(&mut buf).await?;
    println!("device got ack: {}", String::from_utf8_lossy(&buf[..n]));

    tokio::time::sleep(Duration::from_millis(100)).await;
    for event in memory.events() {
        println!(
            "stored: device {} at ({}, {})",
            event.device_id, event.latitude, event.longitude
        );
    }
    Ok(())
}
