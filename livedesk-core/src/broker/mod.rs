//! Topic-indexed fan-out to live connections.
//!
//! Delivery is best-effort process-local; durability comes from the session
//! store, not from here. Each connection owns a bounded outbound queue so a
//! slow consumer cannot stall fan-out to its peers: `BestEffort` frames
//! (typing, presence, queue positions, stats) are dropped when the queue is
//! full, `Guaranteed` frames (chat messages, lifecycle events) fall back to
//! an awaited send on that one connection.

pub mod envelope;
pub mod topics;

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub use envelope::{events, Envelope};

/// Per-connection outbound queue depth.
const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Must reach every subscriber; applies backpressure per connection.
    Guaranteed,
    /// May be dropped for a congested connection.
    BestEffort,
}

#[derive(Clone)]
pub struct Broker {
    connections: Arc<DashMap<Uuid, mpsc::Sender<Envelope>>>,
    topics: Arc<DashMap<String, HashSet<Uuid>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            topics: Arc::new(DashMap::new()),
        }
    }

    /// Register a connection and hand back the receiving end of its
    /// outbound queue. The gateway's writer task drains it into the socket.
    pub fn register(&self, conn_id: Uuid) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        self.connections.insert(conn_id, tx);
        rx
    }

    /// Drop a connection and remove it from every topic. Mandatory on
    /// disconnect.
    pub fn unregister(&self, conn_id: Uuid) {
        self.connections.remove(&conn_id);
        self.topics.retain(|_, subs| {
            subs.remove(&conn_id);
            !subs.is_empty()
        });
    }

    pub fn subscribe(&self, conn_id: Uuid, topic: &str) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(conn_id);
    }

    /// Idempotent; unsubscribing a non-subscriber is a no-op.
    pub fn unsubscribe(&self, conn_id: Uuid, topic: &str) {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.remove(&conn_id);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    /// Current subscribers of a topic. Used to move an agent's connections
    /// onto a session topic on accept/transfer.
    pub fn subscribers(&self, topic: &str) -> Vec<Uuid> {
        self.topics
            .get(topic)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fan an envelope out to every subscriber of `topic`. Returns the
    /// number of connections it was handed to.
    pub async fn publish(&self, topic: &str, envelope: Envelope, delivery: Delivery) -> usize {
        let subscriber_ids: Vec<Uuid> = match self.topics.get(topic) {
            Some(subs) => subs.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut backlogged: Vec<(mpsc::Sender<Envelope>, Envelope)> = Vec::new();

        for conn_id in subscriber_ids {
            let tx = match self.connections.get(&conn_id) {
                Some(entry) => entry.clone(),
                None => continue,
            };
            match tx.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    if delivery == Delivery::Guaranteed {
                        backlogged.push((tx, frame));
                    } else {
                        debug!(topic, conn = %conn_id, event = %envelope.event,
                               "dropping best-effort frame for slow consumer");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        // Slow consumers get their guaranteed frames one by one, after the
        // fast path has finished; only the congested connection waits.
        for (tx, frame) in backlogged {
            if tx.send(frame).await.is_ok() {
                delivered += 1;
            }
        }

        delivered
    }

    /// Deliver directly to one connection, bypassing topics. Used for
    /// `system:error` and `session:restored`.
    pub async fn send_to(&self, conn_id: Uuid, envelope: Envelope) -> bool {
        let tx = match self.connections.get(&conn_id) {
            Some(entry) => entry.clone(),
            None => return false,
        };
        tx.send(envelope).await.is_ok()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn publish_fans_out_to_all_subscribers() {
        let broker = Broker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = broker.register(a);
        let mut rx_b = broker.register(b);
        broker.subscribe(a, "queue");
        broker.subscribe(b, "queue");

        let n = broker
            .publish("queue", Envelope::new(events::QUEUE_UPDATE, json!({})), Delivery::Guaranteed)
            .await;
        assert_eq!(n, 2);
        assert_eq!(rx_a.recv().await.unwrap().event, events::QUEUE_UPDATE);
        assert_eq!(rx_b.recv().await.unwrap().event, events::QUEUE_UPDATE);
    }

    #[tokio::test]
    async fn publish_reaches_only_the_topic() {
        let broker = Broker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = broker.register(a);
        let mut rx_b = broker.register(b);
        broker.subscribe(a, "session:1");
        broker.subscribe(b, "session:2");

        broker
            .publish("session:1", Envelope::new(events::CHAT_MESSAGE, json!({})), Delivery::Guaranteed)
            .await;

        assert!(rx_a.recv().await.is_some());
        assert!(timeout(Duration::from_millis(50), rx_b.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let broker = Broker::new();
        let a = Uuid::new_v4();
        let _rx = broker.register(a);
        broker.subscribe(a, "queue");
        broker.unsubscribe(a, "queue");
        broker.unsubscribe(a, "queue");
        broker.unsubscribe(a, "never-subscribed");
        assert_eq!(broker.subscriber_count("queue"), 0);
    }

    #[tokio::test]
    async fn unregister_removes_from_every_topic() {
        let broker = Broker::new();
        let a = Uuid::new_v4();
        let _rx = broker.register(a);
        broker.subscribe(a, "queue");
        broker.subscribe(a, "admin-stats");
        broker.unregister(a);
        assert_eq!(broker.subscriber_count("queue"), 0);
        assert_eq!(broker.subscriber_count("admin-stats"), 0);
        assert!(!broker.send_to(a, Envelope::new("x", json!({}))).await);
    }

    #[tokio::test]
    async fn best_effort_frames_drop_when_queue_full() {
        let broker = Broker::new();
        let a = Uuid::new_v4();
        let mut rx = broker.register(a);
        broker.subscribe(a, "t");

        // Saturate the outbound queue without draining it.
        for _ in 0..OUTBOUND_BUFFER {
            broker
                .publish("t", Envelope::new(events::CHAT_MESSAGE, json!({})), Delivery::Guaranteed)
                .await;
        }

        let n = broker
            .publish("t", Envelope::new(events::CHAT_CUSTOMER_TYPING, json!({})), Delivery::BestEffort)
            .await;
        assert_eq!(n, 0, "typing frame should be dropped, not queued");

        // Drain everything; no typing frame should surface.
        let mut seen_typing = false;
        while let Ok(Some(env)) = timeout(Duration::from_millis(20), rx.recv()).await {
            if env.event == events::CHAT_CUSTOMER_TYPING {
                seen_typing = true;
            }
        }
        assert!(!seen_typing);
    }

    #[tokio::test]
    async fn guaranteed_frames_wait_out_a_full_queue() {
        let broker = Broker::new();
        let a = Uuid::new_v4();
        let mut rx = broker.register(a);
        broker.subscribe(a, "t");

        for _ in 0..OUTBOUND_BUFFER {
            broker
                .publish("t", Envelope::new(events::CHAT_MESSAGE, json!({"n": "fill"})), Delivery::Guaranteed)
                .await;
        }

        // Drain in a separate task so the awaited send can complete.
        let drain = tokio::spawn(async move {
            let mut last = None;
            while let Ok(Some(env)) = timeout(Duration::from_millis(200), rx.recv()).await {
                last = Some(env);
            }
            last
        });

        let n = broker
            .publish("t", Envelope::new(events::CHAT_RESOLVED, json!({})), Delivery::Guaranteed)
            .await;
        assert_eq!(n, 1);

        let last = drain.await.unwrap();
        assert_eq!(last.unwrap().event, events::CHAT_RESOLVED);
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_is_quiet() {
        let broker = Broker::new();
        let n = broker
            .publish("session:none", Envelope::new("x", json!({})), Delivery::Guaranteed)
            .await;
        assert_eq!(n, 0);
    }
}
