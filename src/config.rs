//! Command-line configuration.

use std::time::Duration;

use clap::Parser;

use crate::pipeline::{DEFAULT_PERSISTENCE_QUEUE, DEFAULT_PERSISTENCE_WORKERS};
use crate::server::DEFAULT_UDP_WORKERS;
use crate::session::SessionConfig;

/// Telemetry gateway for GPS/LBS tracker fleets.
#[derive(Debug, Clone, Parser)]
#[command(name = "trackgate", version, about)]
pub struct GatewayConfig {
    /// TCP listen address.
    #[arg(long, default_value = "0.0.0.0:8082")]
    pub tcp_addr: String,

    /// UDP listen address; UDP ingest is off when absent.
    #[arg(long)]
    pub udp_addr: Option<String>,

    /// Storage connection URL.
    #[arg(long, default_value = "mysql://root@127.0.0.1:3306/cargts")]
    pub storage_url: String,

    /// Maximum open storage connections.
    #[arg(long, default_value_t = 100)]
    pub storage_conns: u32,

    /// Close a session after this many seconds without bytes.
    #[arg(long, default_value_t = 90)]
    pub read_timeout_secs: u64,

    /// Frames buffered per session before the oldest is dropped.
    #[arg(long, default_value_t = 800)]
    pub session_queue: usize,

    /// Records buffered ahead of storage before the oldest is dropped.
    #[arg(long, default_value_t = DEFAULT_PERSISTENCE_QUEUE)]
    pub persistence_queue: usize,

    /// Concurrent storage writer tasks.
    #[arg(long, default_value_t = DEFAULT_PERSISTENCE_WORKERS)]
    pub persistence_workers: usize,

    /// UDP worker tasks.
    #[arg(long, default_value_t = DEFAULT_UDP_WORKERS)]
    pub udp_workers: usize,

    /// Seconds between pending-command refreshes.
    #[arg(long, default_value_t = 30)]
    pub command_refresh_secs: u64,

    /// Upper bound on one frame, bytes.
    #[arg(long, default_value_t = 2048)]
    pub max_frame_len: usize,

    /// Seconds between status reports.
    #[arg(long, default_value_t = 120)]
    pub report_interval_secs: u64,

    /// Log filter when RUST_LOG is unset (e.g. `info`, `trackgate=debug`).
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

impl GatewayConfig {
    /// Per-session view of the configuration.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            queue_capacity: self.session_queue,
            max_frame_len: self.max_frame_len,
        }
    }

    pub fn command_refresh(&self) -> Duration {
        Duration::from_secs(self.command_refresh_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}
