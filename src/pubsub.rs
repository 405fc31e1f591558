//! Publish/subscribe hub for feeding subscription producers.
//!
//! Hosts typically back `GraphqlEngine` subscriptions with a topic hub:
//! `subscribe` yields a [`ResultStream`] the server engine can forward,
//! and `complete` ends every stream on a topic. Cancellation propagates
//! naturally: when the transport drops a stream, its bridge exits and
//! the topic sheds that receiver.

use crate::execution::{ResultSender, ResultStream};
use crate::protocol::ExecutionResult;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const DEFAULT_CAPACITY: usize = 256;
const STREAM_BUFFER: usize = 16;

/// A publish/subscribe hub for GraphQL subscriptions.
#[derive(Clone)]
pub struct PubSub {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<ExecutionResult>>>>,
    capacity: usize,
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publishes one result to a topic. Returns how many subscribers
    /// received it.
    pub async fn publish(&self, topic: impl AsRef<str>, result: ExecutionResult) -> usize {
        let topics = self.topics.read().await;
        match topics.get(topic.as_ref()) {
            Some(sender) => sender.send(result).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribes to a topic as a result stream. The stream ends when
    /// the topic is completed; dropping it unsubscribes.
    pub async fn subscribe(&self, topic: impl Into<String>) -> ResultStream {
        let topic = topic.into();
        let receiver = {
            let mut topics = self.topics.write().await;
            match topics.get(&topic) {
                Some(sender) => sender.subscribe(),
                None => {
                    let (sender, receiver) = broadcast::channel(self.capacity);
                    topics.insert(topic, sender);
                    receiver
                }
            }
        };

        let (stream, sender) = ResultStream::channel(STREAM_BUFFER);
        tokio::spawn(bridge(receiver, sender));
        stream
    }

    /// Completes a topic: every subscriber's stream terminates normally.
    pub async fn complete(&self, topic: &str) {
        self.topics.write().await.remove(topic);
    }

    /// Number of topics with at least one past subscriber.
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// True when the topic currently has subscribers.
    pub async fn has_subscribers(&self, topic: &str) -> bool {
        match self.topics.read().await.get(topic) {
            Some(sender) => sender.receiver_count() > 0,
            None => false,
        }
    }

    /// Drops topics nobody listens to anymore.
    pub async fn cleanup(&self) {
        let mut topics = self.topics.write().await;
        topics.retain(|_, sender| sender.receiver_count() > 0);
    }
}

/// Forwards broadcast values into one subscriber's stream until either
/// side goes away. Lagged receivers skip the missed values and keep
/// going.
async fn bridge(mut receiver: broadcast::Receiver<ExecutionResult>, sender: ResultSender) {
    loop {
        tokio::select! {
            _ = sender.closed() => break,
            received = receiver.recv() => match received {
                Ok(result) => {
                    if sender.send(result).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_subscribe_complete() {
        let pubsub = PubSub::new();
        let mut stream = pubsub.subscribe("greetings").await;

        assert_eq!(
            pubsub
                .publish("greetings", ExecutionResult::data(json!({"greetings": "Hi"})))
                .await,
            1
        );
        let result = stream.next().await.unwrap().unwrap();
        assert_eq!(result.data, Some(json!({"greetings": "Hi"})));

        pubsub.complete("greetings").await;
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let pubsub = PubSub::new();
        assert_eq!(
            pubsub.publish("nobody", ExecutionResult::default()).await,
            0
        );
    }

    #[tokio::test]
    async fn test_dropping_stream_unsubscribes() {
        let pubsub = PubSub::new();
        let stream = pubsub.subscribe("events").await;
        assert!(pubsub.has_subscribers("events").await);

        drop(stream);
        // The bridge observes the closed stream on its next wakeup.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pubsub.has_subscribers("events").await);

        pubsub.cleanup().await;
        assert_eq!(pubsub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_independent_subscribers() {
        let pubsub = PubSub::new();
        let mut a = pubsub.subscribe("t").await;
        let mut b = pubsub.subscribe("t").await;

        pubsub
            .publish("t", ExecutionResult::data(json!({"n": 1})))
            .await;
        assert_eq!(
            a.next().await.unwrap().unwrap().data,
            Some(json!({"n": 1}))
        );
        assert_eq!(
            b.next().await.unwrap().unwrap().data,
            Some(json!({"n": 1}))
        );
    }
}
