//! End-to-end tests over a real loopback TCP server.
//!
//! A full gateway (registry, caches, persistence pool) runs against the
//! in-memory storage backend; devices are simulated with plain sockets.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use trackgate::commands::{Command, CommandCache, CommandStatus, CMD_KIND_REPORT_INTERVAL};
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

async fn start_gateway(
    storage: Arc<MemoryStorage>,
) -> (std::net::SocketAddr, Arc<GatewayContext>) {
    let storage_dyn: Arc<dyn Storage> = storage;
    let stats = Arc::new(GatewayStats::new());
    let ctx = Arc::new(GatewayContext {
        directory: Arc::new(DeviceDirectory::new(storage_dyn.clone())),
        commands: Arc::new(CommandCache::new(storage_dyn.clone())),
        storage: storage_dyn.clone(),
        stats: stats.clone(),
        transform: identity_transform,
        cells: Arc::new(NullCellLocator),
    });

    let mut registry = ProtocolRegistry::new();
    registry.register(Arc::new(EworldProtocol));
    registry.register(Arc::new(Atr805Protocol));

    let persistence = Arc::new(BoundedQueue::new(1024));
    pipeline::spawn_persistence_pool(persistence.clone(), storage_dyn, stats, 2);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::run_tcp_server(
        listener,
        Arc::new(registry),
        ctx.clone(),
        persistence,
        SessionConfig {
            read_timeout: Duration::from_secs(2),
            ..SessionConfig::default()
        },
    ));
    (addr, ctx)
}

fn position_sentence(sn: &str) -> String {
    let now = Utc::now();
    format!(
        "*HQ,{sn},V1,{},A,3015.5000,N,12030.0000,E,10,90,{},FFFFFFFF,5#",
        now.format("%H%M%S"),
        now.format("%d%m%y"),
    )
}

async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_split_sentence_ends_up_in_storage() {
    let storage = Arc::new(MemoryStorage::new());
    storage.push_device("42", "WORLD2020916012");
    let (addr, _ctx) = start_gateway(storage.clone()).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    let sentence = position_sentence("2020916012");
    let (a, b) = sentence.as_bytes().split_at(13);
    conn.write_all(a).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.write_all(b).await.unwrap();

    // The session answers with a time acknowledgement.
    let mut buf = vec![0u8; 256];
    let n = conn.read(&mut buf).await.unwrap();
    let ack = std::str::from_utf8(&buf[..n]).unwrap();
    assert!(ack.starts_with("*TH,2020916012,I1,"), "got {ack:?}");

    assert!(wait_for(|| !storage.events().is_empty()).await);
    let events = storage.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].device_id, "42");
    assert_eq!(storage.latest("42").unwrap().device_id, "42");
}

#[tokio::test]
async fn test_unknown_imei_stores_nothing() {
    let storage = Arc::new(MemoryStorage::new());
    let (addr, ctx) = start_gateway(storage.clone()).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(position_sentence("9999").as_bytes())
        .await
        .unwrap();

    // The frame is received and handled, but the handler rejects it.
    assert!(wait_for(|| {
        ctx.stats
            .pkts_received
            .load(std::sync::atomic::Ordering::Relaxed)
            == 1
    })
    .await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(storage.events().is_empty());
}

#[tokio::test]
async fn test_binary_protocol_confirm_and_record() {
    let storage = Arc::new(MemoryStorage::new());
    storage.push_device("7", "ATR201509160102");
    let (addr, _ctx) = start_gateway(storage.clone()).await;

    // GPS packet at 30°15.50' N, 120°30.00' E, timestamped "now".
    let sn = [0x20u8, 0x15, 0x09, 0x16, 0x01, 0x02];
    let mut packet = vec![0u8; 29];
    packet[0..2].copy_from_slice(&[0x92, 0x29]);
    packet[2] = 0x80;
    packet[3..5].copy_from_slice(&24u16.to_be_bytes());
    packet[5..11].copy_from_slice(&sn);
    packet[0x0b] = 0x30;
    packet[0x0c] = 0x15;
    packet[0x0d] = 0x50;
    packet[0x10] = 0x01;
    packet[0x11] = 0x20;
    packet[0x12] = 0x30;
    let digits = Utc::now().format("%y%m%d%H%M%S").to_string();
    for (i, pair) in digits.as_bytes().chunks(2).enumerate() {
        packet[0x16 + i] = ((pair[0] - b'0') << 4) | (pair[1] - b'0');
    }
    packet[28] = 0x0D;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(&packet).await.unwrap();

    let mut buf = vec![0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    let mut expected = vec![0x92, 0x29, 0x21, 0x00, 0x0A];
    expected.extend_from_slice(&sn);
    expected.extend_from_slice(&[0x80, 0xFF, 0xFF, 0x0D]);
    assert_eq!(&buf[..n], &expected[..]);

    assert!(wait_for(|| !storage.events().is_empty()).await);
    let events = storage.events();
    assert_eq!(events[0].device_id, "7");
    assert_eq!(events[0].latitude, format!("{:.4}", 30.0 + 15.5 / 60.0));
}

#[tokio::test]
async fn test_pending_command_delivered_on_next_report() {
    let storage = Arc::new(MemoryStorage::new());
    storage.push_device("42", "WORLD2020916012");
    storage.push_command(Command {
        id: "c1".into(),
        device_id: "42".into(),
        kind: CMD_KIND_REPORT_INTERVAL.into(),
        params: "0800,30".into(),
        status: CommandStatus::Pending,
    });
    let (addr, ctx) = start_gateway(storage.clone()).await;
    ctx.commands.refresh().await.unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(position_sentence("2020916012").as_bytes())
        .await
        .unwrap();

    let mut buf = vec![0u8; 256];
    let n = conn.read(&mut buf).await.unwrap();
    let ack = std::str::from_utf8(&buf[..n]).unwrap();
    assert_eq!(ack, "*TH,2020916012,I2,050400,0,0,14,XRDDCS16000030#");
    assert!(wait_for(|| storage.command_status("c1") == Some(CommandStatus::Applied)).await);
}
