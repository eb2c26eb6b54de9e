//! Message handling and persistence tasks.
//!
//! Two tiers of queues decouple the socket loops from storage latency.
//! Each session has a worker queue of framed messages drained by one
//! worker task; the records those handlers produce land on one global
//! persistence queue drained by a fixed pool of storage writers. Both
//! tiers are bounded and drop their oldest entry on overflow, so a slow
//! database costs the oldest telemetry, never liveness.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::protocol::{GatewayContext, InboundMessage};
use crate::queue::{BoundedQueue, Enqueue};
use crate::stats::GatewayStats;
use crate::storage::{EventRecord, Storage};

/// Default capacity of the global persistence queue.
pub const DEFAULT_PERSISTENCE_QUEUE: usize = 65536;
/// Default number of storage writer tasks.
pub const DEFAULT_PERSISTENCE_WORKERS: usize = 4;

/// Spawn the worker task draining one message queue.
///
/// Runs until the queue is closed and drained. Handler errors are logged
/// and the session keeps going; an unknown device or a failed command
/// commit must not take down the connection.
pub fn spawn_session_worker(
    queue: Arc<BoundedQueue<InboundMessage>>,
    ctx: Arc<GatewayContext>,
    persistence: Arc<BoundedQueue<EventRecord>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = queue.dequeue().await {
            let started = Instant::now();
            let protocol = Arc::clone(&message.protocol);
            match protocol.handle(&message, &ctx).await {
                Ok(records) => {
                    for record in records {
                        match persistence.try_enqueue(record) {
                            Enqueue::Ok => {}
                            Enqueue::Evicted(_) => {
                                ctx.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!("persistence queue overflow, dropped oldest record");
                            }
                            Enqueue::Closed(_) => return,
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(remote = %message.remote, protocol = protocol.name(), %err,
                        "message handling failed");
                }
            }
            ctx.stats
                .observe_worker_micros(started.elapsed().as_micros() as u64);
        }
    })
}

/// Spawn the fixed pool of storage writers draining the persistence queue.
///
/// Pool size bounds concurrent storage writes; a failed write drops the
/// record (no retry) and is counted.
pub fn spawn_persistence_pool(
    queue: Arc<BoundedQueue<EventRecord>>,
    storage: Arc<dyn Storage>,
    stats: Arc<GatewayStats>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker| {
            let queue = Arc::clone(&queue);
            let storage = Arc::clone(&storage);
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                while let Some(record) = queue.dequeue().await {
                    let started = Instant::now();
                    match storage.save_event(&record).await {
                        Ok(()) => {
                            stats.records_stored.fetch_add(1, Ordering::Relaxed);
                            stats.observe_db_micros(started.elapsed().as_micros() as u64);
                        }
                        Err(err) => {
                            stats.records_dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(worker, device_id = %record.device_id, %err,
                                "storage write failed, record dropped");
                        }
                    }
                }
            })
        })
        .collect()
}
