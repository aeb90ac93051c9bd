//! Bounded priority outbound queue (C3), owned by the connection agent.
//!
//! The buffer shape — a `VecDeque` guarded by a single lock with push/drain
//! operations — is carried over from the teacher's outbox `GlobalBuffer`;
//! the overflow policy is inverted from reject-on-full to drop-oldest, and
//! retry-budget bookkeeping is layered on top via `ghost_common::Envelope`.

use ghost_common::Envelope;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// A single-producer-safe-for-many, single-consumer bounded queue.
///
/// Capacity `N` (default 1000, see `ghost_config::QueueConfig`). Ordering is
/// enqueue order: priority affects retention (which envelope gets evicted
/// is unaffected by priority — only *retry budget* differs by priority) and
/// retry budget, never dispatch order.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    dropped_count: AtomicU64,
}

impl OutboundQueue {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            dropped_count: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total envelopes dropped via overflow eviction. The agent's
    /// `Statistics.total_messages_dropped` counter is driven by this, plus
    /// drops from exhausted retry budgets that happen outside the queue.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Push a new envelope onto the back. If the queue is at capacity, the
    /// oldest envelope is evicted first and returned to the caller so it can
    /// be logged or accounted for.
    pub fn enqueue(&self, envelope: Envelope) -> Option<Envelope> {
        let mut guard = self.inner.lock();
        let evicted = if guard.len() >= self.capacity {
            let dropped = guard.pop_front();
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            if let Some(ref dropped) = dropped {
                warn!(channel = %dropped.channel, "outbound queue at capacity, dropping oldest envelope");
            }
            dropped
        } else {
            None
        };
        guard.push_back(envelope);
        evicted
    }

    /// Re-enqueue an in-flight envelope at the *front* of the queue — used
    /// when a send attempt fails while disconnected (§4.3), so the envelope
    /// is retried ahead of traffic that was never attempted. Still subject
    /// to the same drop-oldest eviction if the queue happens to be full.
    pub fn requeue_front(&self, envelope: Envelope) -> Option<Envelope> {
        let mut guard = self.inner.lock();
        let evicted = if guard.len() >= self.capacity {
            let dropped = guard.pop_back();
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            dropped
        } else {
            None
        };
        guard.push_front(envelope);
        evicted
    }

    pub fn pop_front(&self) -> Option<Envelope> {
        self.inner.lock().pop_front()
    }

    /// Drain every currently-queued envelope, in enqueue order, for the
    /// sender loop to process in one pass.
    pub fn drain(&self) -> Vec<Envelope> {
        let mut guard = self.inner.lock();
        guard.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_common::{EnvelopeKind, Payload, Priority};

    fn env(channel: &str, priority: Priority) -> Envelope {
        Envelope::new(channel, Payload::Generic(vec![]), EnvelopeKind::Generic, priority)
    }

    #[test]
    fn fifo_order_preserved() {
        let q = OutboundQueue::new(10);
        q.enqueue(env("a", Priority::Low));
        q.enqueue(env("b", Priority::High));
        q.enqueue(env("c", Priority::Normal));
        let drained = q.drain();
        let channels: Vec<_> = drained.iter().map(|e| e.channel.as_str()).collect();
        assert_eq!(channels, vec!["a", "b", "c"]);
    }

    #[test]
    fn overflow_drops_oldest() {
        let q = OutboundQueue::new(2);
        q.enqueue(env("a", Priority::Critical));
        q.enqueue(env("b", Priority::Critical));
        let evicted = q.enqueue(env("c", Priority::Critical));
        assert_eq!(evicted.unwrap().channel, "a");
        assert_eq!(q.dropped_count(), 1);
        let remaining: Vec<_> = q.drain().iter().map(|e| e.channel.clone()).collect();
        assert_eq!(remaining, vec!["b", "c"]);
    }

    #[test]
    fn requeue_front_reorders_ahead_of_pending() {
        let q = OutboundQueue::new(10);
        q.enqueue(env("new", Priority::Normal));
        let mut retried = env("retry", Priority::High);
        retried.retry_count += 1;
        q.requeue_front(retried);
        let drained = q.drain();
        assert_eq!(drained[0].channel, "retry");
        assert_eq!(drained[0].retry_count, 1);
        assert_eq!(drained[1].channel, "new");
    }

    #[test]
    fn retry_budget_ceiling_by_priority() {
        let low = env("x", Priority::Low);
        assert_eq!(low.max_retries, 2);
        let critical = env("y", Priority::Critical);
        assert_eq!(critical.max_retries, 20);
        assert!(low.can_retry());
    }
}
