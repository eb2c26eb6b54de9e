//! Socket servers: TCP accept loop and UDP datagram loop.
//!
//! TCP spawns one [`crate::session`] task per accepted connection. UDP is
//! connectionless: one read task claims a protocol per datagram and feeds
//! a shared queue drained by a fixed worker pool, replies addressed back
//! to the datagram source.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};

use crate::pipeline;
use crate::protocol::{
    FrameOutcome, GatewayContext, InboundMessage, ProtocolRegistry, ReplyHandle,
};
use crate::queue::{BoundedQueue, Enqueue};
use crate::session::{self, SessionConfig};
use crate::storage::EventRecord;

/// Default number of UDP worker tasks.
pub const DEFAULT_UDP_WORKERS: usize = 4;

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 2048;

/// Accept TCP connections forever, one session task each.
///
/// Accept errors are logged and the loop keeps going; transient resource
/// exhaustion must not stop the listener.
pub async fn run_tcp_server(
    listener: TcpListener,
    registry: Arc<ProtocolRegistry>,
    ctx: Arc<GatewayContext>,
    persistence: Arc<BoundedQueue<EventRecord>>,
    config: SessionConfig,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tokio::spawn(session::run_session(
                    stream,
                    remote,
                    Arc::clone(&registry),
                    Arc::clone(&ctx),
                    Arc::clone(&persistence),
                    config.clone(),
                ));
            }
            Err(err) => {
                ctx.stats.recv_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%err, "accept failed");
            }
        }
    }
}

/// Read UDP datagrams forever, dispatching through a fixed worker pool.
///
/// Each datagram is claimed independently; devices behind NAT change
/// source addresses between reports, so nothing is bound per peer. A
/// datagram may carry several frames back to back.
pub async fn run_udp_server(
    socket: UdpSocket,
    registry: Arc<ProtocolRegistry>,
    ctx: Arc<GatewayContext>,
    persistence: Arc<BoundedQueue<EventRecord>>,
    workers: usize,
    queue_capacity: usize,
) {
    let socket = Arc::new(socket);
    let queue: Arc<BoundedQueue<InboundMessage>> = Arc::new(BoundedQueue::new(queue_capacity));
    for _ in 0..workers {
        pipeline::spawn_session_worker(queue.clone(), ctx.clone(), persistence.clone());
    }

    let mut scratch = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, remote) = match socket.recv_from(&mut scratch).await {
            Ok(rn) => rn,
            Err(err) => {
                ctx.stats.recv_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%err, "udp read failed");
                continue;
            }
        };
        let datagram = session::strip_line_endings(&scratch[..n]);
        if datagram.is_empty() {
            continue;
        }
        dispatch_datagram(datagram, remote, &socket, &registry, &ctx, &queue);
    }
}

/// Claim, frame, and enqueue every message carried by one datagram.
fn dispatch_datagram(
    datagram: &[u8],
    remote: SocketAddr,
    socket: &Arc<UdpSocket>,
    registry: &ProtocolRegistry,
    ctx: &GatewayContext,
    queue: &BoundedQueue<InboundMessage>,
) {
    let protocol = match registry.claim_first(datagram) {
        Some(p) => p,
        None => {
            ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
            tracing::error!(%remote, head = %hex::encode(&datagram[..datagram.len().min(32)]),
                "unrecognized datagram");
            return;
        }
    };

    // The pre-claim strip keeps a lone CR; drop it for text protocols.
    let mut rest = if protocol.strips_line_endings() {
        session::strip_line_endings_text(datagram)
    } else {
        datagram
    };
    while !rest.is_empty() {
        match protocol.frame(rest) {
            FrameOutcome::Complete { consumed } => {
                let (frame, tail) = rest.split_at(consumed);
                rest = tail;
                ctx.stats.pkts_received.fetch_add(1, Ordering::Relaxed);
                let message = InboundMessage {
                    protocol: Arc::clone(&protocol),
                    bytes: bytes::Bytes::copy_from_slice(frame),
                    remote,
                    reply: ReplyHandle::Datagram {
                        socket: Arc::clone(socket),
                        remote,
                    },
                };
                match queue.try_enqueue(message) {
                    Enqueue::Ok => {}
                    Enqueue::Evicted(_) => {
                        ctx.stats.pkts_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(%remote, "udp queue overflow, dropped oldest frame");
                    }
                    Enqueue::Closed(_) => return,
                }
            }
            // Datagrams either carry whole frames or are broken; there is
            // no stream to wait on.
            FrameOutcome::Incomplete => {
                ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%remote, "truncated datagram frame");
                return;
            }
            FrameOutcome::Invalid(reason) => {
                ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%remote, reason, "malformed datagram frame");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandCache;
    use crate::directory::DeviceDirectory;
    use crate::geo::{identity_transform, NullCellLocator};
    use crate::stats::GatewayStats;
    use crate::storage::MemoryStorage;
    use crate::vendors::EworldProtocol;

    fn test_ctx(storage: Arc<MemoryStorage>) -> Arc<GatewayContext> {
        Arc::new(GatewayContext {
            directory: Arc::new(DeviceDirectory::new(storage.clone())),
            commands: Arc::new(CommandCache::new(storage.clone())),
            storage,
            stats: Arc::new(GatewayStats::new()),
            transform: identity_transform,
            cells: Arc::new(NullCellLocator),
        })
    }

    #[tokio::test]
    async fn test_dispatch_datagram_splits_multiple_frames() {
        let ctx = test_ctx(Arc::new(MemoryStorage::new()));
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(EworldProtocol));
        let queue = BoundedQueue::new(8);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        // The text protocol frames a chunk ending in `#` as one frame, so
        // these two sentences arrive as one message; a trailing fragment
        // would instead flag the datagram as truncated.
        dispatch_datagram(
            b"*HQ,1,V1#*HQ,2,V1#",
            "127.0.0.1:9000".parse().unwrap(),
            &socket,
            &registry,
            &ctx,
            &queue,
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(ctx.stats.pkts_received.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_dispatch_unrecognized_datagram_counted() {
        let ctx = test_ctx(Arc::new(MemoryStorage::new()));
        let registry = ProtocolRegistry::new();
        let queue = BoundedQueue::new(8);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        dispatch_datagram(
            &[0xDE, 0xAD],
            "127.0.0.1:9000".parse().unwrap(),
            &socket,
            &registry,
            &ctx,
            &queue,
        );
        assert!(queue.is_empty());
        assert_eq!(ctx.stats.pkts_invalid.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_dispatch_truncated_datagram_counted() {
        let ctx = test_ctx(Arc::new(MemoryStorage::new()));
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(EworldProtocol));
        let queue = BoundedQueue::new(8);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        dispatch_datagram(
            b"*HQ,1,V1",
            "127.0.0.1:9000".parse().unwrap(),
            &socket,
            &registry,
            &ctx,
            &queue,
        );
        assert!(queue.is_empty());
        assert_eq!(ctx.stats.pkts_invalid.load(Ordering::Relaxed), 1);
    }
}
