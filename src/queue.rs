//! Bounded FIFO queue with drop-oldest backpressure.
//!
//! Producers never block: when the queue is full, [`BoundedQueue::try_enqueue`]
//! evicts the oldest element to make room and reports the eviction so the
//! caller can increment its drop counter. Consumers block asynchronously on
//! [`BoundedQueue::dequeue`] until an item arrives or the queue is closed.
//!
//! This is the backpressure primitive behind both the per-session worker
//! queues and the global persistence queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Outcome of a non-blocking enqueue.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue<T> {
    /// Item was appended within capacity.
    Ok,
    /// Queue was full; the returned oldest item was evicted to admit the new one.
    Evicted(T),
    /// Queue is closed; the item is handed back untouched.
    Closed(T),
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity FIFO with drop-oldest overflow semantics.
///
/// Cheaply cloneable; clones share the same queue.
pub struct BoundedQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// The backing storage grows lazily; a large capacity does not
    /// preallocate.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
            capacity,
        }
    }

    /// Non-blocking enqueue with drop-oldest overflow.
    ///
    /// The check-capacity-then-evict-then-insert sequence runs under one
    /// lock acquisition; producers never await.
    pub fn try_enqueue(&self, item: T) -> Enqueue<T> {
        let evicted = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Enqueue::Closed(item);
            }
            let evicted = if inner.items.len() >= self.capacity {
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        match evicted {
            Some(old) => Enqueue::Evicted(old),
            None => Enqueue::Ok,
        }
    }

    /// Dequeue the oldest item, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            // Register interest before checking, so a notify between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue. Terminal: blocked consumers wake and drain the
    /// remaining items, then observe `None`; further enqueues are refused.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
