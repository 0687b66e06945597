//! In-process backing store.
//!
//! Lists live in one map behind a mutex, so `push_front_trimmed` is atomic.
//! Topics are bounded broadcast channels: a subscriber that falls more than
//! `topic_capacity` payloads behind skips what it missed.

use super::{BoxFuture, ListStore, PubSub, Subscription};
use crate::error::ChatResult;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

/// Default number of payloads buffered per topic.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

pub struct MemoryStore {
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    topic_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_topic_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_topic_capacity(topic_capacity: usize) -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            topic_capacity: topic_capacity.max(1),
        }
    }

    async fn topic_sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.topic_capacity).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ListStore for MemoryStore {
    fn push_front<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, ChatResult<()>> {
        Box::pin(async move {
            let mut lists = self.lists.lock().await;
            lists.entry(key.to_string()).or_default().push_front(value);
            Ok(())
        })
    }

    fn trim<'a>(&'a self, key: &'a str, max_len: usize) -> BoxFuture<'a, ChatResult<()>> {
        Box::pin(async move {
            let mut lists = self.lists.lock().await;
            if let Some(list) = lists.get_mut(key) {
                list.truncate(max_len);
            }
            Ok(())
        })
    }

    fn range<'a>(
        &'a self,
        key: &'a str,
        offset: usize,
        limit: usize,
    ) -> BoxFuture<'a, ChatResult<Vec<Vec<u8>>>> {
        Box::pin(async move {
            let lists = self.lists.lock().await;
            Ok(lists
                .get(key)
                .map(|list| list.iter().skip(offset).take(limit).cloned().collect())
                .unwrap_or_default())
        })
    }

    fn len<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ChatResult<usize>> {
        Box::pin(async move {
            let lists = self.lists.lock().await;
            Ok(lists.get(key).map(VecDeque::len).unwrap_or(0))
        })
    }

    fn push_front_trimmed<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        max_len: usize,
    ) -> BoxFuture<'a, ChatResult<()>> {
        Box::pin(async move {
            let mut lists = self.lists.lock().await;
            let list = lists.entry(key.to_string()).or_default();
            list.push_front(value);
            list.truncate(max_len);
            Ok(())
        })
    }
}

impl PubSub for MemoryStore {
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, ChatResult<usize>> {
        Box::pin(async move {
            let sender = self.topic_sender(topic).await;
            // No subscribers is not an error: the payload is simply not seen.
            let reached = sender.send(payload).unwrap_or(0);
            debug!(topic, reached, "published");
            Ok(reached)
        })
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, ChatResult<Box<dyn Subscription>>> {
        Box::pin(async move {
            let sender = self.topic_sender(topic).await;
            let sub: Box<dyn Subscription> = Box::new(MemorySubscription {
                topic: topic.to_string(),
                rx: sender.subscribe(),
            });
            Ok(sub)
        })
    }
}

struct MemorySubscription {
    topic: String,
    rx: broadcast::Receiver<Vec<u8>>,
}

impl Subscription for MemorySubscription {
    fn recv(&mut self) -> BoxFuture<'_, Option<Vec<u8>>> {
        Box::pin(async move {
            loop {
                match self.rx.recv().await {
                    Ok(payload) => return Some(payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %self.topic, skipped, "subscriber lagged, payloads skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }
}
