//! # trackgate
//!
//! Telemetry ingestion gateway for GPS/LBS tracker fleets.
//!
//! Devices connect over TCP or UDP, speak one of several vendor wire
//! formats, and report position fixes or observed cell towers. The
//! gateway frames the byte stream, resolves the hardware identity to an
//! internal device id, answers with acknowledgements and pending
//! commands, and persists normalized records through a bounded,
//! drop-oldest pipeline.
//!
//! ## Architecture
//!
//! - **Sessions** ([`session`]): one task per TCP connection, deadline
//!   reads, claim-first protocol binding, framing.
//! - **Plugins** ([`protocol`], [`vendors`]): one [`protocol::Protocol`]
//!   implementation per vendor wire format.
//! - **Pipeline** ([`queue`], [`pipeline`]): per-session worker queues
//!   and a global persistence queue, both bounded, oldest evicted on
//!   overflow.
//! - **Caches** ([`directory`], [`commands`]): imei/id resolution and the
//!   pending-command mirror over [`storage::Storage`].
//!
//! ## Example
//!
//! ```ignore
//! use trackgate::protocol::ProtocolRegistry;
//! use trackgate::vendors::{Atr805Protocol, EworldProtocol};
//!
//! let mut registry = ProtocolRegistry::new();
//! registry.register(std::sync::Arc::new(EworldProtocol));
//! registry.register(std::sync::Arc::new(Atr805Protocol));
//! ```

pub mod codec;
pub mod commands;
pub mod config;
pub mod directory;
pub mod error;
pub mod geo;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;
pub mod stats;
pub mod storage;
pub mod vendors;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use protocol::{GatewayContext, Protocol, ProtocolRegistry};
