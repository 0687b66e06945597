//! History gateway: replays a user's stored backlog when they join.

use super::upstream::HistorySource;
use crate::relay::{ConnectionRegistry, DeliveryResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct HistoryGateway {
    source: Arc<dyn HistorySource>,
    registry: Arc<ConnectionRegistry>,
    /// Cap on the fetch from the history source.
    fetch_timeout: Duration,
    /// Cap on each write into the joining connection's queue.
    write_timeout: Duration,
}

impl HistoryGateway {
    pub fn new(
        source: Arc<dyn HistorySource>,
        registry: Arc<ConnectionRegistry>,
        fetch_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            source,
            registry,
            fetch_timeout,
            write_timeout,
        }
    }

    /// Fetch `user`'s backlog and deliver it, in the store's newest-first
    /// order, tagged as history. Returns how many envelopes were delivered.
    ///
    /// An unreachable or slow source yields an empty backlog.
    pub async fn replay(&self, user: &str) -> usize {
        let backlog = match tokio::time::timeout(self.fetch_timeout, self.source.fetch(user)).await {
            Ok(Ok(backlog)) => backlog,
            Ok(Err(e)) => {
                warn!(user = %user, error = %e, "history fetch failed, joining with empty backlog");
                return 0;
            }
            Err(_) => {
                warn!(user = %user, "history fetch timed out, joining with empty backlog");
                return 0;
            }
        };

        let mut replayed = 0;
        for envelope in backlog {
            match self
                .registry
                .deliver_timeout(user, envelope.as_history(), self.write_timeout)
                .await
            {
                DeliveryResult::Delivered => replayed += 1,
                DeliveryResult::Offline | DeliveryResult::Dead => {
                    debug!(user = %user, replayed, "connection gone during replay");
                    break;
                }
            }
        }
        info!(user = %user, replayed, "history replayed");
        replayed
    }

    /// Run [`replay`](Self::replay) on its own task.
    pub fn spawn_replay(self: &Arc<Self>, user: String) -> JoinHandle<usize> {
        let gateway = self.clone();
        tokio::spawn(async move { gateway.replay(&user).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::upstream::LocalHistory;
    use crate::relay::{ConnectionHandle, ConnectionMailbox, MailboxEvent};
    use chat_core::store::BoxFuture;
    use chat_core::{ChatError, ChatResult, Envelope, HistoryMode, HistoryStore, MemoryStore};

    struct DownSource;

    impl HistorySource for DownSource {
        fn fetch<'a>(&'a self, _user: &'a str) -> BoxFuture<'a, ChatResult<Vec<Envelope>>> {
            Box::pin(async { Err(ChatError::Upstream("connection refused".into())) })
        }
    }

    struct SlowSource;

    impl HistorySource for SlowSource {
        fn fetch<'a>(&'a self, _user: &'a str) -> BoxFuture<'a, ChatResult<Vec<Envelope>>> {
            Box::pin(std::future::pending())
        }
    }

    async fn joined(registry: &ConnectionRegistry, user: &str, capacity: usize) -> ConnectionMailbox {
        let (handle, mailbox) = ConnectionHandle::new(registry.next_conn_id(), capacity);
        assert!(registry.register(user, handle).await);
        mailbox
    }

    fn gateway(source: Arc<dyn HistorySource>, registry: Arc<ConnectionRegistry>) -> Arc<HistoryGateway> {
        Arc::new(HistoryGateway::new(
            source,
            registry,
            Duration::from_millis(100),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn replays_backlog_as_history() {
        let history = Arc::new(HistoryStore::new(Arc::new(MemoryStore::new()), 300));
        for text in ["one", "two"] {
            history
                .append("messages:bob", &Envelope::chat("alice", "bob", text))
                .await
                .unwrap();
        }
        let registry = Arc::new(ConnectionRegistry::new());
        let mut bob = joined(&registry, "bob", 64).await;
        let source = Arc::new(LocalHistory::new(history, HistoryMode::Mailbox, "chat_messages", 300));

        let replayed = gateway(source, registry).spawn_replay("bob".into()).await.unwrap();
        assert_eq!(replayed, 2);

        let mut texts = Vec::new();
        for _ in 0..2 {
            match bob.next().await {
                MailboxEvent::Deliver(env) => {
                    assert!(env.history);
                    texts.push(env.text);
                }
                MailboxEvent::Closed => panic!("mailbox closed"),
            }
        }
        assert_eq!(texts, vec!["two", "one"]);
    }

    #[tokio::test]
    async fn empty_store_replays_nothing() {
        let history = Arc::new(HistoryStore::new(Arc::new(MemoryStore::new()), 300));
        let registry = Arc::new(ConnectionRegistry::new());
        let _alice = joined(&registry, "alice", 8).await;
        let source = Arc::new(LocalHistory::new(history, HistoryMode::Mailbox, "chat_messages", 300));
        assert_eq!(gateway(source, registry.clone()).replay("alice").await, 0);
        assert!(registry.is_registered("alice").await);
    }

    #[tokio::test]
    async fn unreachable_source_degrades_to_empty() {
        let registry = Arc::new(ConnectionRegistry::new());
        let _bob = joined(&registry, "bob", 8).await;
        assert_eq!(gateway(Arc::new(DownSource), registry.clone()).replay("bob").await, 0);
        assert_eq!(gateway(Arc::new(SlowSource), registry.clone()).replay("bob").await, 0);
        assert!(registry.is_registered("bob").await);
    }

    #[tokio::test]
    async fn backlog_larger_than_queue_is_delivered() {
        let history = Arc::new(HistoryStore::new(Arc::new(MemoryStore::new()), 300));
        for i in 0..20 {
            history
                .append("messages:bob", &Envelope::chat("alice", "bob", &i.to_string()))
                .await
                .unwrap();
        }
        let registry = Arc::new(ConnectionRegistry::new());
        let mut bob = joined(&registry, "bob", 4).await;
        let source = Arc::new(LocalHistory::new(history, HistoryMode::Mailbox, "chat_messages", 300));
        let task = gateway(source, registry).spawn_replay("bob".into());

        let mut received = 0;
        while received < 20 {
            match bob.next().await {
                MailboxEvent::Deliver(_) => received += 1,
                MailboxEvent::Closed => panic!("mailbox closed"),
            }
        }
        assert_eq!(task.await.unwrap(), 20);
    }
}
