//! Stream session: deadline reads, protocol binding, framing, dispatch.
//!
//! One task per connection owns the read half and the frame buffer. The
//! first bytes of the stream pick the protocol (claim-first over the
//! registry, bound for the session's lifetime); every completed frame is
//! pushed onto the session's bounded worker queue, newest-wins. A
//! dedicated writer task owns the write half so handlers queue reply
//! bytes without touching the socket.
//!
//! Read inactivity past the configured deadline closes the session; dead
//! battery-powered trackers are the norm, not the exception.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::GatewayError;
use crate::pipeline;
use crate::protocol::{
    FrameOutcome, GatewayContext, InboundMessage, Protocol, ProtocolRegistry, ReplyHandle,
};
use crate::queue::{BoundedQueue, Enqueue};
use crate::storage::EventRecord;

/// Default read inactivity deadline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(90);
/// Default per-session worker queue capacity.
pub const DEFAULT_SESSION_QUEUE: usize = 800;
/// Default upper bound on one frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 2048;

/// Reply channel depth per session.
const REPLY_CHANNEL_CAPACITY: usize = 64;
/// Socket read chunk size.
const READ_CHUNK: usize = 1024;

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Close the session after this long without bytes.
    pub read_timeout: Duration,
    /// Worker queue capacity; the oldest frame is evicted on overflow.
    pub queue_capacity: usize,
    /// A buffer growing past this without completing a frame is invalid.
    pub max_frame_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            queue_capacity: DEFAULT_SESSION_QUEUE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Strip a trailing `\n` or `\r\n` from a read chunk.
///
/// Interactive terminal tests append line endings the devices never send.
/// A lone trailing `\r` is left alone: this form is used before a
/// protocol is bound, when the chunk may be a binary frame terminated by
/// `0x0D`. Once a text protocol is bound, [`strip_line_endings_text`]
/// applies.
pub fn strip_line_endings(chunk: &[u8]) -> &[u8] {
    let mut end = chunk.len();
    if end > 0 && chunk[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && chunk[end - 1] == b'\r' {
            end -= 1;
        }
    }
    &chunk[..end]
}

/// Strip up to two trailing CR/LF bytes in any order, lone `\r`
/// included. Only safe once the stream is known to be line-oriented
/// text; see [`Protocol::strips_line_endings`].
pub fn strip_line_endings_text(chunk: &[u8]) -> &[u8] {
    let mut end = chunk.len();
    for _ in 0..2 {
        if end > 0 && (chunk[end - 1] == b'\n' || chunk[end - 1] == b'\r') {
            end -= 1;
        }
    }
    &chunk[..end]
}

/// Drive one stream session to completion.
///
/// Returns when the peer closes, the read deadline expires, or the stream
/// turns out to be unrecognizable or malformed. The worker queue is
/// drained before return so already-framed messages are not lost.
pub async fn run_session<S>(
    stream: S,
    remote: SocketAddr,
    registry: Arc<ProtocolRegistry>,
    ctx: Arc<GatewayContext>,
    persistence: Arc<BoundedQueue<EventRecord>>,
    config: SessionConfig,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    ctx.stats.conns_created.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(%remote, "session opened");

    let (mut read_half, write_half) = tokio::io::split(stream);
    let (reply_tx, writer) = spawn_writer(write_half, remote);
    let reply = ReplyHandle::Stream(reply_tx);

    let queue: Arc<BoundedQueue<InboundMessage>> =
        Arc::new(BoundedQueue::new(config.queue_capacity));
    let worker = pipeline::spawn_session_worker(queue.clone(), ctx.clone(), persistence);

    let mut buf = BytesMut::with_capacity(config.max_frame_len);
    let mut scratch = vec![0u8; READ_CHUNK];
    let mut bound: Option<Arc<dyn Protocol>> = None;

    'session: loop {
        let n = match timeout(config.read_timeout, read_half.read(&mut scratch)).await {
            Err(_) => {
                ctx.stats.recv_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%remote, "read deadline expired");
                break;
            }
            Ok(Err(err)) => {
                ctx.stats.recv_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%remote, %err, "read error");
                break;
            }
            Ok(Ok(0)) => {
                tracing::debug!(%remote, "peer closed");
                break;
            }
            Ok(Ok(n)) => n,
        };

        let chunk: &[u8] = match &bound {
            Some(p) if p.strips_line_endings() => strip_line_endings_text(&scratch[..n]),
            Some(_) => &scratch[..n],
            None => strip_line_endings(&scratch[..n]),
        };
        if chunk.is_empty() {
            tracing::debug!(%remote, "empty chunk after line-ending strip");
            continue;
        }
        buf.extend_from_slice(chunk);

        if bound.is_none() {
            match registry.claim_first(&buf) {
                Some(protocol) => {
                    tracing::debug!(%remote, protocol = protocol.name(), "protocol bound");
                    // The pre-binding strip keeps a lone CR; drop it now
                    // if the bound protocol is line-oriented.
                    if protocol.strips_line_endings() {
                        let keep = strip_line_endings_text(&buf).len();
                        buf.truncate(keep);
                    }
                    bound = Some(protocol);
                }
                // Claiming retries as bytes accumulate; binary protocols
                // need a minimum prefix before they will answer.
                None if buf.len() < config.max_frame_len => continue,
                None => {
                    ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
                    let err = GatewayError::ProtocolUnrecognized(hex::encode(
                        &buf[..buf.len().min(32)],
                    ));
                    tracing::error!(%remote, %err, "closing session");
                    break;
                }
            }
        }
        let protocol = match &bound {
            Some(p) => Arc::clone(p),
            None => continue,
        };

        while !buf.is_empty() {
            match protocol.frame(&buf) {
                FrameOutcome::Incomplete => {
                    if buf.len() > config.max_frame_len {
                        ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
                        let err = GatewayError::Framing(format!(
                            "frame exceeds maximum length ({} > {})",
                            buf.len(),
                            config.max_frame_len
                        ));
                        tracing::error!(%remote, %err, "closing session");
                        break 'session;
                    }
                    break;
                }
                FrameOutcome::Invalid(reason) => {
                    ctx.stats.pkts_invalid.fetch_add(1, Ordering::Relaxed);
                    let err = GatewayError::Framing(reason);
                    tracing::error!(%remote, %err, "closing session");
                    break 'session;
                }
                FrameOutcome::Complete { consumed } => {
                    let frame = buf.split_to(consumed).freeze();
                    ctx.stats.pkts_received.fetch_add(1, Ordering::Relaxed);
                    let message = InboundMessage {
                        protocol: Arc::clone(&protocol),
                        bytes: frame,
                        remote,
                        reply: reply.clone(),
                    };
                    match queue.try_enqueue(message) {
                        Enqueue::Ok => {}
                        Enqueue::Evicted(_) => {
                            ctx.stats.pkts_dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(%remote, "worker queue overflow, dropped oldest frame");
                        }
                        Enqueue::Closed(_) => break 'session,
                    }
                }
            }
        }
    }

    queue.close();
    let _ = worker.await;
    drop(reply);
    let _ = writer.await;
    ctx.stats.conns_closed.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(%remote, "session closed");
}

/// Spawn the dedicated writer task owning the stream's write half.
///
/// The task exits when every sender clone is gone or the peer stops
/// accepting bytes.
fn spawn_writer<W>(mut writer: W, remote: SocketAddr) -> (mpsc::Sender<Bytes>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(REPLY_CHANNEL_CAPACITY);
    let task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(err) = writer.write_all(&bytes).await {
                tracing::debug!(%remote, %err, "write failed, stopping writer");
                break;
            }
            if let Err(err) = writer.flush().await {
                tracing::debug!(%remote, %err, "flush failed, stopping writer");
                break;
            }
        }
    });
    (tx, task)
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
    use chrono::Utc;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_strip_line_endings() {
        assert_eq!(strip_line_endings(b"abc\r\n"), b"abc");
        assert_eq!(strip_line_endings(b"abc\n"), b"abc");
        assert_eq!(strip_line_endings(b"abc"), b"abc");
        assert_eq!(strip_line_endings(b"\r\n"), b"");
        // Before a protocol is bound, a lone CR may be a binary frame
        // terminator and is kept.
        assert_eq!(strip_line_endings(b"abc\r"), b"abc\r");
        assert_eq!(strip_line_endings(b"abc\n\r\n"), b"abc\n");

        // The text form also takes a lone CR, at most two bytes total.
        assert_eq!(strip_line_endings_text(b"abc\r"), b"abc");
        assert_eq!(strip_line_endings_text(b"abc\r\n"), b"abc");
        assert_eq!(strip_line_endings_text(b"abc\n\r\n"), b"abc\n");
    }

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

    fn registry() -> Arc<ProtocolRegistry> {
        let mut r = ProtocolRegistry::new();
        r.register(Arc::new(EworldProtocol));
        Arc::new(r)
    }

    fn position_sentence(sn: &str) -> String {
        let now = Utc::now();
        format!(
            "*HQ,{sn},V1,{},A,3015.5000,N,12030.0000,E,10,90,{},FFFFFFFF,5#",
            now.format("%H%M%S"),
            now.format("%d%m%y"),
        )
    }

    #[tokio::test]
    async fn test_split_sentence_reassembled_across_reads() {
        let storage = Arc::new(MemoryStorage::new());
        storage.push_device("42", "WORLD123");
        let ctx = test_ctx(storage);
        let persistence = Arc::new(BoundedQueue::new(16));

        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(run_session(
            server,
            "127.0.0.1:9000".parse().unwrap(),
            registry(),
            ctx.clone(),
            persistence.clone(),
            SessionConfig {
                read_timeout: Duration::from_secs(1),
                ..SessionConfig::default()
            },
        ));

        // Feed the sentence in two arbitrary pieces, then close.
        let sentence = position_sentence("123");
        let (a, b) = sentence.as_bytes().split_at(11);
        let mut client = client;
        client.write_all(a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);
        session.await.unwrap();

        let record = persistence.dequeue().await.unwrap();
        assert_eq!(record.device_id, "42");
        assert_eq!(ctx.stats.pkts_received.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unrecognized_stream_closes_session() {
        let ctx = test_ctx(Arc::new(MemoryStorage::new()));
        let persistence = Arc::new(BoundedQueue::new(16));

        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(run_session(
            server,
            "127.0.0.1:9000".parse().unwrap(),
            registry(),
            ctx.clone(),
            persistence,
            SessionConfig {
                read_timeout: Duration::from_secs(1),
                max_frame_len: 16,
                ..SessionConfig::default()
            },
        ));

        let mut client = client;
        client.write_all(&[0xDE; 32]).await.unwrap();
        session.await.unwrap();
        assert_eq!(ctx.stats.pkts_invalid.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.stats.conns_closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cr_only_line_endings_accepted_once_bound() {
        let storage = Arc::new(MemoryStorage::new());
        storage.push_device("42", "WORLD123");
        let ctx = test_ctx(storage);
        let persistence = Arc::new(BoundedQueue::new(16));

        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(run_session(
            server,
            "127.0.0.1:9000".parse().unwrap(),
            registry(),
            ctx.clone(),
            persistence.clone(),
            SessionConfig {
                read_timeout: Duration::from_secs(1),
                ..SessionConfig::default()
            },
        ));

        // Every write ends with a bare CR, first chunk included.
        let mut client = client;
        let first = format!("{}\r", position_sentence("123"));
        client.write_all(first.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = format!("{}\r", position_sentence("123"));
        client.write_all(second.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);
        session.await.unwrap();

        assert!(persistence.dequeue().await.is_some());
        assert!(persistence.dequeue().await.is_some());
        assert_eq!(ctx.stats.pkts_received.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_crlf_only_reads_are_ignored() {
        let storage = Arc::new(MemoryStorage::new());
        storage.push_device("42", "WORLD123");
        let ctx = test_ctx(storage);
        let persistence = Arc::new(BoundedQueue::new(16));

        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(run_session(
            server,
            "127.0.0.1:9000".parse().unwrap(),
            registry(),
            ctx.clone(),
            persistence.clone(),
            SessionConfig {
                read_timeout: Duration::from_secs(1),
                ..SessionConfig::default()
            },
        ));

        let mut client = client;
        client.write_all(b"\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sentence = format!("{}\r\n", position_sentence("123"));
        client.write_all(sentence.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);
        session.await.unwrap();

        assert!(persistence.dequeue().await.is_some());
    }
}
