//! Pub/sub message bus (C1): channel-pattern routing, ordered per-channel
//! delivery, priority-tagged envelopes, and an end-to-end availability probe.
//!
//! Trait shape (`publish`/`subscribe` split into separate concerns) is
//! carried over from the teacher's `QueuePublisher`/`QueueConsumer` split;
//! the body is new — an in-memory fan-out keyed by compiled channel-pattern
//! regexes rather than a polling pull-queue.

pub mod error;

use async_trait::async_trait;
use dashmap::DashMap;
use ghost_common::{Payload, Priority};
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

pub use error::{BusError, Result};

/// Default per-message retention (§4.1): best-effort, not enforced as a
/// hard expiry on the in-memory path since messages are delivered
/// synchronously to already-subscribed listeners or dropped, never queued
/// past their first (and only) dispatch attempt.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// Bounded capacity of each subscriber's mailbox. A slow subscriber that
/// falls behind has messages dropped rather than unbounded memory growth —
/// consistent with the bus's best-effort delivery semantics.
const SUBSCRIBER_CAPACITY: usize = 1024;

/// A message as delivered to a subscriber: the concrete channel it arrived
/// on (so a `health:*` subscriber can recover the peer id) plus the payload.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub channel: String,
    pub payload: Payload,
    pub priority: Priority,
}

/// Translate a subscription pattern into the regex described in §4.1: exact
/// channels match literally; `*` expands to `.*` inside an otherwise
/// fully-escaped, anchored pattern.
fn compile_pattern(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    if !pattern.contains('*') {
        return Regex::new(&format!("^{}$", regex::escape(pattern)));
    }
    let mut rx = String::from("^");
    let parts: Vec<&str> = pattern.split('*').collect();
    for (i, part) in parts.iter().enumerate() {
        rx.push_str(&regex::escape(part));
        if i + 1 < parts.len() {
            rx.push_str(".*");
        }
    }
    rx.push('$');
    Regex::new(&rx)
}

struct Listener {
    pattern: String,
    regex: Regex,
    tx: mpsc::Sender<Delivery>,
}

/// In-memory, best-effort pub/sub bus. Subscriptions are dispatched
/// synchronously from `publish` via `try_send`; a full subscriber mailbox
/// drops the message rather than blocking the publisher (ordering per
/// channel is preserved among messages that are delivered, per §4.1).
pub struct InMemoryBus {
    listeners: DashMap<u64, Listener>,
    next_id: AtomicU64,
    /// Flipped to simulate a transport outage in tests / diagnostics.
    available: std::sync::atomic::AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
            available: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Test/diagnostics hook: force `isAvailable()` to fail without tearing
    /// down the bus.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn dispatch(&self, delivery: &Delivery) {
        for entry in self.listeners.iter() {
            let listener = entry.value();
            if listener.regex.is_match(&delivery.channel) {
                if listener.tx.try_send(delivery.clone()).is_err() {
                    warn!(channel = %delivery.channel, pattern = %listener.pattern, "dropping message: subscriber mailbox full or closed");
                }
            }
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription. Dropping it (or calling [`Subscription::cancel`])
/// unregisters the listener so `publish` stops considering it.
pub struct Subscription {
    id: u64,
    pattern: String,
    stream: ReceiverStream<Delivery>,
    bus: Arc<InMemoryBus>,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.stream.next().await
    }

    pub fn cancel(self) {
        // Drop handles deregistration.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.listeners.remove(&self.id);
    }
}

impl Stream for Subscription {
    type Item = Delivery;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.stream).poll_next(cx)
    }
}

/// The C1 bus contract.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Payload) -> Result<()> {
        self.publish_with_priority(channel, payload, Priority::Normal)
            .await
    }

    /// Implementations lacking real priority transport degrade to plain
    /// `publish`; the outbound queue (C3) never depends on bus-level
    /// reordering, only on this call succeeding or failing.
    async fn publish_with_priority(
        &self,
        channel: &str,
        payload: Payload,
        priority: Priority,
    ) -> Result<()>;

    async fn subscribe(self: Arc<Self>, pattern: &str) -> Result<Subscription>;

    async fn unsubscribe(&self, pattern: &str) -> Result<()>;

    async fn is_available(&self) -> bool;
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish_with_priority(
        &self,
        channel: &str,
        payload: Payload,
        priority: Priority,
    ) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BusError::Core(ghost_common::GhostError::TransportUnavailable));
        }
        debug!(%channel, ?priority, "publishing");
        self.dispatch(&Delivery {
            channel: channel.to_string(),
            payload,
            priority,
        });
        Ok(())
    }

    async fn subscribe(self: Arc<Self>, pattern: &str) -> Result<Subscription> {
        let regex = compile_pattern(pattern)
            .map_err(|e| BusError::InvalidPattern(pattern.to_string(), e.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.listeners.insert(
            id,
            Listener {
                pattern: pattern.to_string(),
                regex,
                tx,
            },
        );
        Ok(Subscription {
            id,
            pattern: pattern.to_string(),
            stream: ReceiverStream::new(rx),
            bus: self,
        })
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.listeners.retain(|_, l| l.pattern != pattern);
        Ok(())
    }

    async fn is_available(&self) -> bool {
        if !self.available.load(Ordering::SeqCst) {
            return false;
        }
        // Write a unique key and read it back under a short deadline,
        // without going through `subscribe` (which requires an owning
        // `Arc<Self>` for its cleanup-on-drop handle): register a listener
        // directly against the shared map and remove it again ourselves.
        let probe_channel = format!("__probe__:{}", uuid::Uuid::new_v4());
        let regex = match compile_pattern(&probe_channel) {
            Ok(r) => r,
            Err(_) => return false,
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel(1);
        self.listeners.insert(
            id,
            Listener {
                pattern: probe_channel.clone(),
                regex,
                tx,
            },
        );
        self.dispatch(&Delivery {
            channel: probe_channel,
            payload: Payload::Generic(vec![1]),
            priority: Priority::High,
        });
        let result = timeout(Duration::from_millis(200), rx.recv()).await;
        self.listeners.remove(&id);
        matches!(result, Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_match_table() {
        let cases: &[(&str, &str, bool)] = &[
            ("events", "events", true),
            ("events", "other", false),
            ("health:*", "health:abc", true),
            ("health:*", "health:", true),
            ("health:*", "metrics:abc", false),
            ("metrics:*", "metrics:abc-123", true),
            ("a*b", "aXXXb", true),
            ("a*b", "ab", true),
            ("a*b", "aXXX", false),
        ];
        for (pattern, channel, expect) in cases {
            let re = compile_pattern(pattern).unwrap();
            assert_eq!(re.is_match(channel), *expect, "pattern={pattern} channel={channel}");
        }
    }

    #[tokio::test]
    async fn subscriber_receives_matching_publish() {
        let bus = Arc::new(InMemoryBus::new());
        let mut sub = Arc::clone(&bus).subscribe("health:*").await.unwrap();
        bus.publish("health:svc-1", Payload::Generic(vec![9]))
            .await
            .unwrap();
        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.channel, "health:svc-1");
    }

    #[tokio::test]
    async fn non_matching_publish_is_not_delivered() {
        let bus = Arc::new(InMemoryBus::new());
        let mut sub = Arc::clone(&bus).subscribe("metrics:*").await.unwrap();
        bus.publish("health:svc-1", Payload::Generic(vec![9]))
            .await
            .unwrap();
        let result = timeout(Duration::from_millis(50), sub.next()).await;
        assert!(result.is_err(), "expected no delivery within the timeout");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = Arc::new(InMemoryBus::new());
        let mut sub = Arc::clone(&bus).subscribe("events").await.unwrap();
        bus.unsubscribe("events").await.unwrap();
        bus.publish("events", Payload::Generic(vec![1])).await.unwrap();
        let result = timeout(Duration::from_millis(50), sub.next()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn publish_fails_when_transport_unavailable() {
        let bus = InMemoryBus::new();
        bus.set_available(false);
        let result = bus.publish("events", Payload::Generic(vec![1])).await;
        assert!(matches!(
            result,
            Err(BusError::Core(ghost_common::GhostError::TransportUnavailable))
        ));
    }

    #[tokio::test]
    async fn is_available_round_trips_a_probe() {
        let bus = Arc::new(InMemoryBus::new());
        assert!(bus.is_available().await);
    }
}
