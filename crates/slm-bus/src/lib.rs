//! In-process pub/sub bus feeding the WebSocket broadcaster.
//!
//! Topics are plain strings (`events:global`, `events:node:{id}`,
//! `jobs:{id}`). Each subscriber owns a bounded channel; `publish` uses
//! try_send so a slow subscriber whose buffer fills is dropped with a log
//! line — publishing latency never depends on the slowest consumer.

#![forbid(unsafe_code)]

use parking_lot::RwLock;
use slm_proto::WsFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const TOPIC_GLOBAL: &str = "events:global";

pub fn topic_node(node_id: &str) -> String {
    format!("events:node:{node_id}")
}

pub fn topic_job(job_id: &str) -> String {
    format!("jobs:{job_id}")
}

const DEFAULT_BUFFER: usize = 256;

struct Slot {
    id: u64,
    tx: mpsc::Sender<WsFrame>,
}

/// The process-wide bus. Cheap to clone; all clones share subscribers.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<String, Vec<Slot>>>>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        }
    }

    /// Subscribe to a topic. Dropping the returned subscription (or its
    /// receiver side) detaches it on the next publish.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Slot { id, tx });
        debug!(topic, subscriber = id, "subscribed");
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
        }
    }

    /// Remove one subscriber from a topic.
    pub fn unsubscribe(&self, topic: &str, subscriber_id: u64) {
        let mut topics = self.topics.write();
        if let Some(slots) = topics.get_mut(topic) {
            slots.retain(|s| s.id != subscriber_id);
            if slots.is_empty() {
                topics.remove(topic);
            }
        }
        debug!(topic, subscriber = subscriber_id, "unsubscribed");
    }

    /// Publish a frame to every subscriber of `topic`. Returns the number of
    /// subscribers the frame was delivered to. Subscribers with full or
    /// closed buffers are dropped, never waited on.
    pub fn publish(&self, topic: &str, frame: WsFrame) -> usize {
        let mut dead: Vec<u64> = Vec::new();
        let mut delivered = 0;

        {
            let topics = self.topics.read();
            let Some(slots) = topics.get(topic) else {
                return 0;
            };
            for slot in slots {
                match slot.tx.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(topic, subscriber = slot.id, "subscriber buffer full, dropping");
                        dead.push(slot.id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(slot.id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut topics = self.topics.write();
            if let Some(slots) = topics.get_mut(topic) {
                slots.retain(|s| !dead.contains(&s.id));
                if slots.is_empty() {
                    topics.remove(topic);
                }
            }
        }

        delivered
    }

    /// Current subscriber count for a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, |s| s.len())
    }
}

/// One subscriber's end of a topic stream.
pub struct Subscription {
    pub id: u64,
    pub topic: String,
    rx: mpsc::Receiver<WsFrame>,
}

impl Subscription {
    /// Receive the next frame; `None` once detached.
    pub async fn recv(&mut self) -> Option<WsFrame> {
        self.rx.recv().await
    }

    /// Non-blocking receive for drain loops.
    pub fn try_recv(&mut self) -> Option<WsFrame> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(n: i64) -> WsFrame {
        WsFrame::new("test", json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_fanout_preserves_order() {
        let bus = EventBus::new(64);
        let mut a = bus.subscribe(TOPIC_GLOBAL);
        let mut b = bus.subscribe(TOPIC_GLOBAL);

        for n in 0..10 {
            assert_eq!(bus.publish(TOPIC_GLOBAL, frame(n)), 2);
        }

        for n in 0..10 {
            assert_eq!(a.recv().await.unwrap().data["n"], n);
            assert_eq!(b.recv().await.unwrap().data["n"], n);
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_publisher_unblocked() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe("jobs:j1");
        let mut live = bus.subscribe("jobs:j1");

        // Fill slow's buffer without draining; keep live drained.
        for n in 0..5 {
            bus.publish("jobs:j1", frame(n));
            assert_eq!(live.recv().await.unwrap().data["n"], n);
        }

        // Slow got the first two frames, then was dropped.
        assert_eq!(slow.try_recv().unwrap().data["n"], 0);
        assert_eq!(slow.try_recv().unwrap().data["n"], 1);
        assert_eq!(bus.subscriber_count("jobs:j1"), 1);
    }

    #[tokio::test]
    async fn test_closed_subscriber_cleaned_up() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe(&topic_node("n1"));
        drop(sub);

        assert_eq!(bus.publish(&topic_node("n1"), frame(1)), 0);
        assert_eq!(bus.subscriber_count(&topic_node("n1")), 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        assert_eq!(bus.publish("jobs:missing", frame(1)), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_target() {
        let bus = EventBus::new(8);
        let a = bus.subscribe(TOPIC_GLOBAL);
        let mut b = bus.subscribe(TOPIC_GLOBAL);

        bus.unsubscribe(TOPIC_GLOBAL, a.id);
        assert_eq!(bus.publish(TOPIC_GLOBAL, frame(7)), 1);
        assert_eq!(b.recv().await.unwrap().data["n"], 7);
    }

    #[test]
    fn test_topic_helpers() {
        assert_eq!(topic_node("n1"), "events:node:n1");
        assert_eq!(topic_job("j9"), "jobs:j9");
    }
}
