//! Connection registry: user id → live connection handle on this node.
//!
//! At most one entry exists per user id. Delivery never blocks: each handle
//! wraps a bounded queue drained by the connection's own task, and a
//! connection whose queue is full or gone is shed (removed and closed)
//! instead of stalling the sender.
//!
//! A join's history replay runs alongside live delivery, so a message sent
//! right after the join can reach the mailbox twice (live, and again from
//! the backlog). The mailbox yields each message id once.

use chat_core::Envelope;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

/// How many recent message ids a mailbox remembers for duplicate suppression.
const RECENT_ID_WINDOW: usize = 1024;

/// Outcome of a single [`ConnectionRegistry::deliver`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Queued on the recipient's connection.
    Delivered,
    /// No connection for that user on this node; the envelope is dropped.
    Offline,
    /// The connection could not accept the envelope and has been shed.
    Dead,
}

/// Write side of a connection, owned by the registry.
#[derive(Debug)]
pub struct ConnectionHandle {
    conn_id: u64,
    tx: mpsc::Sender<Envelope>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl ConnectionHandle {
    /// Create a handle and the mailbox its connection task drains.
    pub fn new(conn_id: u64, capacity: usize) -> (Self, ConnectionMailbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = oneshot::channel();
        (
            Self {
                conn_id,
                tx,
                close_tx: Some(close_tx),
            },
            ConnectionMailbox {
                rx,
                close_rx,
                recent: RecentIds::default(),
            },
        )
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Tell the connection task to hang up.
    fn close(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// What the connection task observes from its mailbox.
#[derive(Debug)]
pub enum MailboxEvent {
    Deliver(Envelope),
    /// The registry shed or dropped this connection.
    Closed,
}

/// Bounded set of the most recently yielded message ids.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentIds {
    /// Record `id`. Returns `false` if it was already seen. Envelopes
    /// without an id are never treated as repeats.
    fn first_sighting(&mut self, id: &str) -> bool {
        if id.is_empty() {
            return true;
        }
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > RECENT_ID_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Read side of a connection handle.
#[derive(Debug)]
pub struct ConnectionMailbox {
    rx: mpsc::Receiver<Envelope>,
    close_rx: oneshot::Receiver<()>,
    recent: RecentIds,
}

impl ConnectionMailbox {
    /// Wait for the next envelope or for the handle to be closed.
    ///
    /// Must not be called again after it has returned [`MailboxEvent::Closed`].
    pub async fn next(&mut self) -> MailboxEvent {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = &mut self.close_rx => return MailboxEvent::Closed,
                msg = self.rx.recv() => match msg {
                    Some(envelope) => envelope,
                    None => return MailboxEvent::Closed,
                },
            };
            if self.recent.first_sighting(&envelope.id) {
                return MailboxEvent::Deliver(envelope);
            }
            debug!(id = %envelope.id, history = envelope.history, "duplicate delivery suppressed");
        }
    }
}

/// Registry of connections local to this node.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate a node-unique connection id.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Store the mapping iff no entry exists for `user`.
    ///
    /// Returns `false` without touching the existing entry otherwise; the
    /// rejected handle is dropped, which closes its mailbox.
    pub async fn register(&self, user: &str, handle: ConnectionHandle) -> bool {
        let mut connections = self.connections.write().await;
        if connections.contains_key(user) {
            warn!(user = %user, "user already registered");
            return false;
        }
        let conn_id = handle.conn_id;
        connections.insert(user.to_string(), handle);
        info!(user = %user, conn_id, "user registered");
        true
    }

    /// Remove the mapping for `user`, if any. Returns whether one was removed.
    pub async fn unregister(&self, user: &str) -> bool {
        let removed = self.connections.write().await.remove(user);
        match removed {
            Some(handle) => {
                debug!(user = %user, conn_id = handle.conn_id, "user unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove the mapping for `user` only if it still belongs to `conn_id`.
    ///
    /// Used on transport loss so a stale connection never evicts a newer one.
    pub async fn release(&self, user: &str, conn_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(user) {
            Some(handle) if handle.conn_id == conn_id => {
                connections.remove(user);
                debug!(user = %user, conn_id, "connection released");
                true
            }
            _ => false,
        }
    }

    /// Queue an envelope for `user` without blocking.
    pub async fn deliver(&self, user: &str, envelope: Envelope) -> DeliveryResult {
        let (conn_id, attempt) = {
            let connections = self.connections.read().await;
            match connections.get(user) {
                Some(handle) => (handle.conn_id, handle.tx.try_send(envelope)),
                None => return DeliveryResult::Offline,
            }
        };

        match attempt {
            Ok(()) => DeliveryResult::Delivered,
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => "queue full",
                    TrySendError::Closed(_) => "connection gone",
                };
                warn!(user = %user, conn_id, reason, "shedding connection");
                self.shed(user, conn_id).await;
                DeliveryResult::Dead
            }
        }
    }

    /// Queue an envelope for `user`, waiting at most `wait` for queue space.
    ///
    /// Used for bulk writes such as history replay, which may exceed the
    /// queue depth. A connection that stays full past `wait` is shed.
    pub async fn deliver_timeout(&self, user: &str, envelope: Envelope, wait: Duration) -> DeliveryResult {
        let (conn_id, tx) = {
            let connections = self.connections.read().await;
            match connections.get(user) {
                Some(handle) => (handle.conn_id, handle.tx.clone()),
                None => return DeliveryResult::Offline,
            }
        };

        match tx.send_timeout(envelope, wait).await {
            Ok(()) => DeliveryResult::Delivered,
            Err(e) => {
                let reason = match e {
                    SendTimeoutError::Timeout(_) => "write timed out",
                    SendTimeoutError::Closed(_) => "connection gone",
                };
                warn!(user = %user, conn_id, reason, "shedding connection");
                self.shed(user, conn_id).await;
                DeliveryResult::Dead
            }
        }
    }

    /// Queue an envelope for every local connection. Returns how many accepted it.
    pub async fn deliver_all(&self, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let connections = self.connections.read().await;
            for (user, handle) in connections.iter() {
                match handle.tx.try_send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dead.push((user.clone(), handle.conn_id)),
                }
            }
        }
        for (user, conn_id) in dead {
            warn!(user = %user, conn_id, "shedding connection during fan-out");
            self.shed(&user, conn_id).await;
        }
        delivered
    }

    async fn shed(&self, user: &str, conn_id: u64) {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(user) {
                Some(handle) if handle.conn_id == conn_id => connections.remove(user),
                _ => None,
            }
        };
        if let Some(handle) = removed {
            handle.close();
        }
    }

    /// Close every connection (server shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (_, handle) in drained {
            handle.close();
        }
    }

    pub async fn is_registered(&self, user: &str) -> bool {
        self.connections.read().await.contains_key(user)
    }

    /// Number of registered users.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle(registry: &ConnectionRegistry, capacity: usize) -> (ConnectionHandle, ConnectionMailbox) {
        ConnectionHandle::new(registry.next_conn_id(), capacity)
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_box) = handle(&registry, 4);
        let (second, mut second_box) = handle(&registry, 4);

        assert!(registry.register("alice", first).await);
        assert!(!registry.register("alice", second).await);
        assert_eq!(registry.count().await, 1);

        // The rejected handle was dropped; the first connection still receives.
        assert!(matches!(second_box.next().await, MailboxEvent::Closed));
        assert_eq!(
            registry.deliver("alice", Envelope::chat("bob", "alice", "hi")).await,
            DeliveryResult::Delivered
        );
        assert!(matches!(first_box.next().await, MailboxEvent::Deliver(e) if e.text == "hi"));
    }

    #[tokio::test]
    async fn same_message_is_yielded_once() {
        let registry = ConnectionRegistry::new();
        let (h, mut mailbox) = handle(&registry, 8);
        registry.register("bob", h).await;

        let live = Envelope::chat("alice", "bob", "just now");
        registry.deliver("bob", live.clone()).await;
        registry.deliver("bob", live.as_history()).await;
        registry.deliver("bob", Envelope::chat("alice", "bob", "next")).await;

        match mailbox.next().await {
            MailboxEvent::Deliver(env) => {
                assert_eq!(env.text, "just now");
                assert!(!env.history);
            }
            MailboxEvent::Closed => panic!("mailbox closed"),
        }
        assert!(matches!(mailbox.next().await, MailboxEvent::Deliver(e) if e.text == "next"));
    }

    #[test]
    fn recent_ids_forget_the_oldest() {
        let mut recent = RecentIds::default();
        assert!(recent.first_sighting("a"));
        assert!(!recent.first_sighting("a"));
        assert!(recent.first_sighting(""));
        assert!(recent.first_sighting(""));
        for i in 0..RECENT_ID_WINDOW {
            assert!(recent.first_sighting(&i.to_string()));
        }
        assert!(recent.first_sighting("a"));
        assert_eq!(recent.ids.len(), RECENT_ID_WINDOW);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (h, _mailbox) = handle(&registry, 4);
        assert!(registry.register("alice", h).await);
        assert!(registry.unregister("alice").await);
        assert!(!registry.unregister("alice").await);
        assert!(!registry.is_registered("alice").await);

        let (again, _mailbox) = handle(&registry, 4);
        assert!(registry.register("alice", again).await);
    }

    #[tokio::test]
    async fn deliver_to_absent_user_is_offline() {
        let registry = ConnectionRegistry::new();
        let result = registry.deliver("bob", Envelope::chat("alice", "bob", "hi")).await;
        assert_eq!(result, DeliveryResult::Offline);
    }

    #[tokio::test]
    async fn full_queue_sheds_connection() {
        let registry = ConnectionRegistry::new();
        let (h, mut mailbox) = handle(&registry, 1);
        registry.register("bob", h).await;

        let first = registry.deliver("bob", Envelope::chat("a", "bob", "1")).await;
        let second = registry.deliver("bob", Envelope::chat("a", "bob", "2")).await;
        assert_eq!(first, DeliveryResult::Delivered);
        assert_eq!(second, DeliveryResult::Dead);
        assert!(!registry.is_registered("bob").await);
        assert!(matches!(mailbox.next().await, MailboxEvent::Closed));
    }

    #[tokio::test]
    async fn deliver_timeout_waits_for_space() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (h, mut mailbox) = handle(&registry, 1);
        registry.register("bob", h).await;

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut results = Vec::new();
                for i in 0..3 {
                    let env = Envelope::chat("a", "bob", &i.to_string());
                    results.push(registry.deliver_timeout("bob", env, Duration::from_secs(2)).await);
                }
                results
            })
        };
        let mut texts = Vec::new();
        for _ in 0..3 {
            if let MailboxEvent::Deliver(env) = mailbox.next().await {
                texts.push(env.text);
            }
        }
        let results = writer.await.unwrap();
        assert!(results.iter().all(|r| *r == DeliveryResult::Delivered));
        assert_eq!(texts, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn deliver_timeout_sheds_stalled_reader() {
        let registry = ConnectionRegistry::new();
        let (h, _mailbox) = handle(&registry, 1);
        registry.register("bob", h).await;
        let wait = Duration::from_millis(20);
        assert_eq!(
            registry.deliver_timeout("bob", Envelope::chat("a", "bob", "1"), wait).await,
            DeliveryResult::Delivered
        );
        assert_eq!(
            registry.deliver_timeout("bob", Envelope::chat("a", "bob", "2"), wait).await,
            DeliveryResult::Dead
        );
        assert!(!registry.is_registered("bob").await);
    }

    #[tokio::test]
    async fn dropped_mailbox_is_dead() {
        let registry = ConnectionRegistry::new();
        let (h, mailbox) = handle(&registry, 4);
        registry.register("bob", h).await;
        drop(mailbox);
        let result = registry.deliver("bob", Envelope::chat("a", "bob", "hi")).await;
        assert_eq!(result, DeliveryResult::Dead);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn release_ignores_other_connections() {
        let registry = ConnectionRegistry::new();
        let (h, _mailbox) = handle(&registry, 4);
        let owner = h.conn_id();
        registry.register("alice", h).await;
        assert!(!registry.release("alice", owner + 100).await);
        assert!(registry.is_registered("alice").await);
        assert!(registry.release("alice", owner).await);
        assert!(!registry.release("alice", owner).await);
    }

    #[tokio::test]
    async fn deliver_all_skips_and_sheds_dead() {
        let registry = ConnectionRegistry::new();
        let (a, mut a_box) = handle(&registry, 4);
        let (b, b_box) = handle(&registry, 4);
        registry.register("a", a).await;
        registry.register("b", b).await;
        drop(b_box);

        let delivered = registry.deliver_all(&Envelope::chat("x", "", "all")).await;
        assert_eq!(delivered, 1);
        assert_eq!(registry.count().await, 1);
        assert!(matches!(a_box.next().await, MailboxEvent::Deliver(_)));
    }

    #[tokio::test]
    async fn concurrent_joins_admit_exactly_one() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (h, mailbox) = ConnectionHandle::new(registry.next_conn_id(), 4);
                (registry.register("alice", h).await, mailbox)
            }));
        }
        let mut admitted = 0;
        let mut mailboxes = Vec::new();
        for task in tasks {
            let (ok, mailbox) = task.await.unwrap();
            if ok {
                admitted += 1;
            }
            mailboxes.push(mailbox);
        }
        assert_eq!(admitted, 1);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn close_all_closes_mailboxes() {
        let registry = ConnectionRegistry::new();
        let (h, mut mailbox) = handle(&registry, 4);
        registry.register("alice", h).await;
        registry.close_all().await;
        assert_eq!(registry.count().await, 0);
        assert!(matches!(mailbox.next().await, MailboxEvent::Closed));
    }
}
