//! In-Memory PubSub
//!
//! Reference implementation of [`PubSub`]: a topic registry mapping each
//! topic string to a shared [`Broadcast`]. Explicitly single-instance; a
//! distributed implementation lives behind the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Broadcast, PubSub, PubSubError};
use crate::stream::EventStream;

/// Single-process topic registry backed by per-topic broadcasts
///
/// Topic entries are created lazily on first subscribe; concurrent
/// subscribers to a not-yet-existing topic race on the write lock and the
/// loser reuses the winner's broadcast.
pub struct MemoryPubSub {
    topics: RwLock<HashMap<String, Broadcast<Value>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Number of topics with a live registry entry
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Number of subscribers currently registered for `topic`
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|b| b.downstream_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), PubSubError> {
        if let Some(broadcast) = self.topics.read().await.get(topic) {
            broadcast.publish(payload);
            tracing::trace!(topic = %topic, "Published event");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<EventStream<Value>, PubSubError> {
        // Fast path: topic already exists
        let broadcast = {
            let topics = self.topics.read().await;
            topics.get(topic).cloned()
        };

        let broadcast = match broadcast {
            Some(broadcast) => broadcast,
            None => {
                // Double-checked under the write lock: only one creation wins
                let mut topics = self.topics.write().await;
                topics
                    .entry(topic.to_string())
                    .or_insert_with(Broadcast::new)
                    .clone()
            }
        };

        let downstream = broadcast.downstream();
        let handle = downstream.handle();

        tracing::debug!(topic = %topic, "Subscriber registered");

        Ok(EventStream::new(downstream, move |_| handle.cancel()))
    }

    async fn close(&self, topic: &str) -> Result<(), PubSubError> {
        if let Some(broadcast) = self.topics.write().await.remove(topic) {
            broadcast.close();
            tracing::debug!(topic = %topic, "Topic closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::stream::EndReason;

    fn collect(
        stream: EventStream<Value>,
    ) -> (
        mpsc::UnboundedReceiver<Value>,
        mpsc::UnboundedReceiver<EndReason>,
        crate::stream::StreamHandle,
    ) {
        let (value_tx, value_rx) = mpsc::unbounded_channel();
        let (end_tx, end_rx) = mpsc::unbounded_channel();
        let handle = stream.produce(
            move |v| {
                let _ = value_tx.send(v);
            },
            move |reason| {
                let _ = end_tx.send(reason);
            },
        );
        (value_rx, end_rx, handle)
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_delivers() {
        let pubsub = MemoryPubSub::new();

        let stream = pubsub.subscribe("orders").await.unwrap();
        let (mut values, _ends, _handle) = collect(stream);

        pubsub.publish("orders", json!({"id": 1})).await.unwrap();

        assert_eq!(values.recv().await, Some(json!({"id": 1})));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let pubsub = MemoryPubSub::new();
        pubsub.publish("nobody", json!(1)).await.unwrap();
        assert_eq!(pubsub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_share_topic() {
        let pubsub = MemoryPubSub::new();

        let a = pubsub.subscribe("ticks").await.unwrap();
        let b = pubsub.subscribe("ticks").await.unwrap();
        assert_eq!(pubsub.subscriber_count("ticks").await, 2);

        let (mut values_a, _ends_a, _ha) = collect(a);
        let (mut values_b, _ends_b, _hb) = collect(b);

        pubsub.publish("ticks", json!(42)).await.unwrap();

        assert_eq!(values_a.recv().await, Some(json!(42)));
        assert_eq!(values_b.recv().await, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_close_terminates_subscribers_and_recreates_topic() {
        let pubsub = MemoryPubSub::new();

        let stream = pubsub.subscribe("alerts").await.unwrap();
        let (mut values, mut ends, _handle) = collect(stream);

        pubsub.close("alerts").await.unwrap();
        assert_eq!(pubsub.topic_count().await, 0);

        // Subscriber observes end of stream; no values were delivered
        assert!(ends.recv().await.is_some());
        assert_eq!(values.try_recv().ok(), None);

        // Next subscribe recreates the topic entry from scratch
        let stream = pubsub.subscribe("alerts").await.unwrap();
        assert_eq!(pubsub.topic_count().await, 1);

        let (mut values, _ends, _handle) = collect(stream);
        pubsub.publish("alerts", json!("fresh")).await.unwrap();
        assert_eq!(values.recv().await, Some(json!("fresh")));
    }

    #[tokio::test]
    async fn test_cancelling_one_subscriber_keeps_topic_alive() {
        let pubsub = MemoryPubSub::new();

        let a = pubsub.subscribe("feed").await.unwrap();
        let b = pubsub.subscribe("feed").await.unwrap();

        let (_values_a, _ends_a, handle_a) = collect(a);
        let (mut values_b, _ends_b, _hb) = collect(b);

        handle_a.stop();
        handle_a.join().await;
        assert_eq!(pubsub.subscriber_count("feed").await, 1);

        pubsub.publish("feed", json!("still here")).await.unwrap();
        assert_eq!(values_b.recv().await, Some(json!("still here")));
    }
}
