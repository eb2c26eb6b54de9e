//! Protocol-plugin dispatch contract.
//!
//! Every vendor wire format (ASCII delimited sentences, length-prefixed
//! binary, fixed-size binary) plugs in behind one contract:
//!
//! - [`Protocol::claim`]: header/magic sanity check on the first chunk;
//! - [`Protocol::frame`]: the tagged framing result
//!   [`FrameOutcome`] `{ Incomplete | Complete | Invalid }` with an explicit
//!   consumed length, so protocols with trailing remainders and protocols
//!   that always consume the whole buffer share one shape;
//! - [`Protocol::handle`]: business handling (identity resolution, command
//!   interaction, normalization into [`EventRecord`]s).
//!
//! Historical plugin revisions disagreed on whether whole-packet detection
//! returned a boolean or a remainder length; the consumed-length form is
//! canonical here and boolean-style protocols are the degenerate
//! `consumed == buffer.len()` case.

pub mod registry;

pub use registry::ProtocolRegistry;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::commands::CommandCache;
use crate::directory::DeviceDirectory;
use crate::error::{GatewayError, Result};
use crate::geo::{CellLocator, CoordTransform};
use crate::stats::GatewayStats;
use crate::storage::{EventRecord, Storage};

/// Result of one framing attempt over the session buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// More bytes are needed; keep accumulating.
    Incomplete,
    /// A frame is complete: the first `consumed` buffered bytes form one
    /// message; anything beyond is remainder and stays buffered.
    Complete {
        /// Number of buffered bytes belonging to this frame.
        consumed: usize,
    },
    /// The buffer violates the wire format; the session must terminate.
    Invalid(String),
}

/// Outbound path back to the originating device.
///
/// TCP sessions write through a per-session writer task fed by a channel so
/// handlers never contend on the socket; UDP replies address the datagram's
/// remote directly.
#[derive(Clone)]
pub enum ReplyHandle {
    /// Channel into a connection's writer task.
    Stream(mpsc::Sender<Bytes>),
    /// Connectionless reply to the datagram source.
    Datagram {
        /// Shared server socket.
        socket: Arc<UdpSocket>,
        /// Source address of the datagram being answered.
        remote: SocketAddr,
    },
    /// Swallows writes; test and demo plumbing.
    Discard,
}

impl ReplyHandle {
    /// Queue bytes for delivery to the device.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        match self {
            ReplyHandle::Stream(tx) => {
                tx.send(bytes).await.map_err(|_| GatewayError::QueueClosed)
            }
            ReplyHandle::Datagram { socket, remote } => {
                socket.send_to(&bytes, remote).await?;
                Ok(())
            }
            ReplyHandle::Discard => Ok(()),
        }
    }
}

/// One framed message awaiting business handling.
pub struct InboundMessage {
    /// The protocol that framed these bytes.
    pub protocol: Arc<dyn Protocol>,
    /// The complete frame, line endings already stripped.
    pub bytes: Bytes,
    /// Remote address of the originating device.
    pub remote: SocketAddr,
    /// Path for command bytes back to the device.
    pub reply: ReplyHandle,
}

/// Shared collaborators handed to every protocol handler.
pub struct GatewayContext {
    /// imei <-> id resolution cache.
    pub directory: Arc<DeviceDirectory>,
    /// Pending-command mirror.
    pub commands: Arc<CommandCache>,
    /// Storage backend (command reconciliation reads).
    pub storage: Arc<dyn Storage>,
    /// Process counters.
    pub stats: Arc<GatewayStats>,
    /// Datum transform applied to resolved fixes.
    pub transform: CoordTransform,
    /// Cell-tower location collaborator.
    pub cells: Arc<dyn CellLocator>,
}

/// A vendor protocol plugin.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this plugin recognizes the stream's first chunk.
    fn claim(&self, bytes: &[u8]) -> bool;

    /// Whether trailing CR/LF bytes on a read chunk are terminal noise
    /// rather than wire data. Binary formats that use `0x0D` as a frame
    /// terminator return false and receive chunks untouched.
    fn strips_line_endings(&self) -> bool {
        true
    }

    /// Attempt to frame one message from the buffered bytes.
    fn frame(&self, bytes: &[u8]) -> FrameOutcome;

    /// Business handling: resolve identity, interact with pending commands,
    /// normalize into storage-ready records.
    ///
    /// An empty Vec means the message carried nothing persistable
    /// (duplicate, ack-only, unparsable content); that is a drop, not an
    /// error.
    async fn handle(
        &self,
        message: &InboundMessage,
        ctx: &GatewayContext,
    ) -> Result<Vec<EventRecord>>;
}
