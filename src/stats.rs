//! Per-process counters and the periodic status report.
//!
//! Every counter is a lock-free atomic shared across sessions, workers and
//! the persistence pool. The management surface polls
//! [`StatsReporter::snapshot`] for a JSON view with per-second rates; the
//! reporter task also writes the same snapshot to the operational log on a
//! fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

/// Shared counter registry.
#[derive(Debug, Default)]
pub struct GatewayStats {
    /// Connections accepted since start.
    pub conns_created: AtomicU64,
    /// Sessions torn down since start.
    pub conns_closed: AtomicU64,
    /// Socket read errors/timeouts.
    pub recv_errors: AtomicU64,
    /// Complete frames received.
    pub pkts_received: AtomicU64,
    /// Frames evicted from a worker queue.
    pub pkts_dropped: AtomicU64,
    /// Frames rejected by framing or content validation.
    pub pkts_invalid: AtomicU64,
    /// Records written to storage.
    pub records_stored: AtomicU64,
    /// Records evicted from the persistence queue or failed to store.
    pub records_dropped: AtomicU64,
    /// Moving-average message handling time, microseconds.
    pub avg_worker_micros: AtomicU64,
    /// Moving-average storage write time, microseconds.
    pub avg_db_micros: AtomicU64,
}

impl GatewayStats {
    /// Create a zeroed registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently active connections.
    pub fn conns_active(&self) -> u64 {
        self.conns_created
            .load(Ordering::Relaxed)
            .saturating_sub(self.conns_closed.load(Ordering::Relaxed))
    }

    /// Fold a worker-time sample into the moving average:
    /// `avg = (avg + sample) / 2`, seeded by the first sample.
    pub fn observe_worker_micros(&self, micros: u64) {
        Self::fold_average(&self.avg_worker_micros, micros);
    }

    /// Fold a storage-write sample into the moving average.
    pub fn observe_db_micros(&self, micros: u64) {
        Self::fold_average(&self.avg_db_micros, micros);
    }

    fn fold_average(cell: &AtomicU64, sample: u64) {
        let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |avg| {
            Some(if avg == 0 { sample } else { (avg + sample) / 2 })
        });
    }
}

/// Point-in-time JSON view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Currently active connections.
    pub conns_active: u64,
    /// Connections accepted since start.
    pub conns_created: u64,
    /// Sessions torn down since start.
    pub conns_closed: u64,
    /// Socket read errors/timeouts.
    pub recv_errors: u64,
    /// Complete frames received.
    pub pkts_received: u64,
    /// Frames evicted from a worker queue.
    pub pkts_dropped: u64,
    /// Frames rejected by framing or content validation.
    pub pkts_invalid: u64,
    /// Records written to storage.
    pub records_stored: u64,
    /// Records evicted from the persistence queue or failed to store.
    pub records_dropped: u64,
    /// Moving-average message handling time, microseconds.
    pub avg_worker_micros: u64,
    /// Moving-average storage write time, microseconds.
    pub avg_db_micros: u64,
    /// Frames per second since the previous snapshot.
    pub pkts_received_ps: f64,
    /// Stored records per second since the previous snapshot.
    pub records_stored_ps: f64,
    /// Dropped frames per second since the previous snapshot.
    pub pkts_dropped_ps: f64,
}

struct LastSample {
    at: Instant,
    pkts_received: u64,
    records_stored: u64,
    pkts_dropped: u64,
}

/// Produces snapshots with per-second deltas against the previous poll.
pub struct StatsReporter {
    stats: Arc<GatewayStats>,
    last: Mutex<LastSample>,
}

impl StatsReporter {
    /// Create a reporter over the shared registry.
    pub fn new(stats: Arc<GatewayStats>) -> Self {
        Self {
            stats,
            last: Mutex::new(LastSample {
                at: Instant::now(),
                pkts_received: 0,
                records_stored: 0,
                pkts_dropped: 0,
            }),
        }
    }

    /// Take a snapshot and advance the rate baseline.
    pub fn snapshot(&self) -> StatsSnapshot {
        let s = &self.stats;
        let pkts_received = s.pkts_received.load(Ordering::Relaxed);
        let records_stored = s.records_stored.load(Ordering::Relaxed);
        let pkts_dropped = s.pkts_dropped.load(Ordering::Relaxed);

        let mut last = self.last.lock();
        let elapsed = last.at.elapsed().as_secs_f64().max(f64::EPSILON);
        let snapshot = StatsSnapshot {
            conns_active: s.conns_active(),
            conns_created: s.conns_created.load(Ordering::Relaxed),
            conns_closed: s.conns_closed.load(Ordering::Relaxed),
            recv_errors: s.recv_errors.load(Ordering::Relaxed),
            pkts_received,
            pkts_dropped,
            pkts_invalid: s.pkts_invalid.load(Ordering::Relaxed),
            records_stored,
            records_dropped: s.records_dropped.load(Ordering::Relaxed),
            avg_worker_micros: s.avg_worker_micros.load(Ordering::Relaxed),
            avg_db_micros: s.avg_db_micros.load(Ordering::Relaxed),
            pkts_received_ps: (pkts_received - last.pkts_received) as f64 / elapsed,
            records_stored_ps: (records_stored - last.records_stored) as f64 / elapsed,
            pkts_dropped_ps: (pkts_dropped - last.pkts_dropped) as f64 / elapsed,
        };
        *last = LastSample {
            at: Instant::now(),
            pkts_received,
            records_stored,
            pkts_dropped,
        };
        snapshot
    }

    /// Spawn the periodic report task, logging the JSON snapshot.
    pub fn spawn_report(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match serde_json::to_string(&self.snapshot()) {
                    Ok(json) => tracing::info!(target: "trackgate::report", %json, "status"),
                    Err(err) => tracing::error!(%err, "failed to serialize status report"),
                }
            }
        })
    }
}
