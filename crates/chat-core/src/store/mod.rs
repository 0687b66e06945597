//! Backing-store contract: named lists plus topic pub/sub.
//!
//! The relay only ever needs `push-front`, `trim`, `range` on a list and
//! `publish`/`subscribe` on a topic carrying opaque bytes. Any backend that
//! offers these (an in-process map, a networked key-value server) can sit
//! behind these traits. Methods return boxed futures so the traits stay
//! object-safe and can be shared as `Arc<dyn ...>`.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::ChatResult;
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Named lists of opaque byte entries, newest at the front.
pub trait ListStore: Send + Sync {
    /// Insert `value` at the head of the list, creating the list if needed.
    fn push_front<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, ChatResult<()>>;

    /// Keep only the first `max_len` entries.
    fn trim<'a>(&'a self, key: &'a str, max_len: usize) -> BoxFuture<'a, ChatResult<()>>;

    /// Read up to `limit` entries starting at `offset` from the head.
    /// A missing list reads as empty.
    fn range<'a>(
        &'a self,
        key: &'a str,
        offset: usize,
        limit: usize,
    ) -> BoxFuture<'a, ChatResult<Vec<Vec<u8>>>>;

    /// Number of entries in the list (0 when missing).
    fn len<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ChatResult<usize>>;

    /// Push then trim as one step.
    ///
    /// Both shipped backends override this with an atomic version; the
    /// default simply composes the two calls.
    fn push_front_trimmed<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        max_len: usize,
    ) -> BoxFuture<'a, ChatResult<()>> {
        Box::pin(async move {
            self.push_front(key, value).await?;
            self.trim(key, max_len).await
        })
    }
}

/// Fire-and-forget topic publish/subscribe.
pub trait PubSub: Send + Sync {
    /// Publish a payload. Returns how many subscribers it reached.
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, ChatResult<usize>>;

    /// Subscribe to a topic. Only payloads published after this call are seen.
    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, ChatResult<Box<dyn Subscription>>>;
}

/// A live topic subscription.
pub trait Subscription: Send {
    /// Next payload, or `None` once the topic is gone.
    fn recv(&mut self) -> BoxFuture<'_, Option<Vec<u8>>>;
}
