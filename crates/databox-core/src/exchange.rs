//! Publish/subscribe exchange used for cross-worker replication

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// What a worker asks its siblings to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerAction {
    /// Apply a cud package
    Cud,
    /// Close the DataBox for all local sockets
    Close,
    /// Forward a client event to all local sockets
    Broadcast,
}

/// Message exchanged between workers on a DataBox topic.
///
/// `worker_id` is mandatory: receivers drop messages that carry their own id,
/// since the origin already delivered to its sockets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub action: WorkerAction,
    pub data: Value,
    #[serde(rename = "workerId")]
    pub worker_id: String,
}

pub type TopicHandler = Arc<dyn Fn(WorkerMessage) + Send + Sync>;

pub type WatchId = u64;

/// Exchange shared by all DataBoxes of a process
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Start delivering messages published on `topic` to `handler`
    fn watch(&self, topic: &str, handler: TopicHandler) -> WatchId;

    /// Stop a watch; the topic is destroyed when no watcher is left
    fn unwatch(&self, topic: &str, watch: WatchId);

    /// Publish to every watcher of `topic`, on every worker
    async fn publish(&self, topic: &str, message: WorkerMessage) -> Result<()>;
}

/// In-process exchange.
///
/// Delivers synchronously to every watcher. Several engine instances with
/// different worker ids can share one `LocalExchange` to behave like a pool
/// of workers behind a broker.
pub struct LocalExchange {
    topics: DashMap<String, Vec<(WatchId, TopicHandler)>>,
    next_watch: AtomicU64,
    published: AtomicU64,
}

impl LocalExchange {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            next_watch: AtomicU64::new(1),
            published: AtomicU64::new(0),
        }
    }

    pub fn is_watched(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn watcher_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|w| w.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> ExchangeStats {
        ExchangeStats {
            topic_count: self.topics.len(),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

impl Default for LocalExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for LocalExchange {
    fn watch(&self, topic: &str, handler: TopicHandler) -> WatchId {
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        trace!(topic, watch = id, "Topic watched");
        id
    }

    fn unwatch(&self, topic: &str, watch: WatchId) {
        let empty = match self.topics.get_mut(topic) {
            Some(mut watchers) => {
                watchers.retain(|(id, _)| *id != watch);
                watchers.is_empty()
            }
            None => false,
        };
        if empty {
            self.topics.remove_if(topic, |_, watchers| watchers.is_empty());
            trace!(topic, "Topic destroyed");
        }
    }

    async fn publish(&self, topic: &str, message: WorkerMessage) -> Result<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        // handlers may unwatch, so no map guard is held while they run
        let handlers: Vec<TopicHandler> = match self.topics.get(topic) {
            Some(watchers) => watchers.iter().map(|(_, h)| h.clone()).collect(),
            None => return Ok(()),
        };
        for handler in handlers {
            handler(message.clone());
        }
        Ok(())
    }
}

/// Exchange statistics
#[derive(Debug, Clone)]
pub struct ExchangeStats {
    pub topic_count: usize,
    pub published: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn message(worker: &str) -> WorkerMessage {
        WorkerMessage {
            action: WorkerAction::Cud,
            data: json!({}),
            worker_id: worker.into(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_watchers() {
        let exchange = LocalExchange::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = seen.clone();
            exchange.watch("DB-a", Arc::new(move |m: WorkerMessage| seen.lock().push(m.worker_id)));
        }
        exchange.publish("DB-a", message("w1")).await.unwrap();
        exchange.publish("DB-b", message("w1")).await.unwrap();

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(exchange.stats().published, 2);
    }

    #[tokio::test]
    async fn test_last_unwatch_destroys_topic() {
        let exchange = LocalExchange::new();
        let a = exchange.watch("DB-a", Arc::new(|_: WorkerMessage| {}));
        let b = exchange.watch("DB-a", Arc::new(|_: WorkerMessage| {}));

        exchange.unwatch("DB-a", a);
        assert_eq!(exchange.watcher_count("DB-a"), 1);
        exchange.unwatch("DB-a", b);
        assert!(!exchange.is_watched("DB-a"));

        // publishing to a destroyed topic is a no-op
        assert!(exchange.publish("DB-a", message("w1")).await.is_ok());
    }

    #[test]
    fn test_worker_message_wire_form() {
        let wire = serde_json::to_value(message("w9")).unwrap();
        assert_eq!(wire, json!({ "action": "cud", "data": {}, "workerId": "w9" }));
    }
}
