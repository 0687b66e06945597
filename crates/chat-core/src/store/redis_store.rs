//! Networked backing store on a Redis server.
//!
//! Lists map onto `LPUSH`/`LTRIM`/`LRANGE`/`LLEN` and topics onto
//! `PUBLISH`/`SUBSCRIBE`, so any number of relay processes and the store
//! service can share history and fan-out through one server.

use super::{BoxFuture, ListStore, PubSub, Subscription};
use crate::error::ChatResult;
use futures_util::stream::{BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Msg};
use tracing::{debug, info, warn};

pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to a server at `url` (`redis://[:password@]host[:port][/db]`).
    pub async fn connect(url: &str) -> ChatResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(addr = %client.get_connection_info().addr, "connected to redis");
        Ok(Self { client, conn })
    }
}

/// Inclusive `LRANGE` bounds for `limit` entries starting at `offset`.
/// `None` when nothing is requested.
fn lrange_bounds(offset: usize, limit: usize) -> Option<(isize, isize)> {
    if limit == 0 {
        return None;
    }
    let max = isize::MAX as usize;
    let start = offset.min(max);
    let stop = offset.saturating_add(limit - 1).min(max);
    Some((start as isize, stop as isize))
}

impl ListStore for RedisStore {
    fn push_front<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, ChatResult<()>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = conn.lpush(key, value).await?;
            Ok(())
        })
    }

    fn trim<'a>(&'a self, key: &'a str, max_len: usize) -> BoxFuture<'a, ChatResult<()>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            match lrange_bounds(0, max_len) {
                Some((start, stop)) => {
                    let _: () = conn.ltrim(key, start, stop).await?;
                }
                None => {
                    let _: () = conn.del(key).await?;
                }
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
            let Some((start, stop)) = lrange_bounds(offset, limit) else {
                return Ok(Vec::new());
            };
            let mut conn = self.conn.clone();
            let entries: Vec<Vec<u8>> = conn.lrange(key, start, stop).await?;
            Ok(entries)
        })
    }

    fn len<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ChatResult<usize>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let len: usize = conn.llen(key).await?;
            Ok(len)
        })
    }

    /// `LPUSH` and `LTRIM` inside one `MULTI`/`EXEC`.
    fn push_front_trimmed<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        max_len: usize,
    ) -> BoxFuture<'a, ChatResult<()>> {
        Box::pin(async move {
            let Some((start, stop)) = lrange_bounds(0, max_len) else {
                return self.trim(key, 0).await;
            };
            let mut conn = self.conn.clone();
            let _: () = redis::pipe()
                .atomic()
                .lpush(key, value)
                .ignore()
                .ltrim(key, start, stop)
                .ignore()
                .query_async(&mut conn)
                .await?;
            debug!(key, max_len, "pushed and trimmed");
            Ok(())
        })
    }
}

impl PubSub for RedisStore {
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, ChatResult<usize>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let reached: usize = conn.publish(topic, payload).await?;
            debug!(topic, reached, "published");
            Ok(reached)
        })
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, ChatResult<Box<dyn Subscription>>> {
        Box::pin(async move {
            // Pub/sub needs a dedicated connection; the multiplexed one stays
            // free for list commands and publishing.
            let mut pubsub = self.client.get_async_pubsub().await?;
            pubsub.subscribe(topic).await?;
            let sub: Box<dyn Subscription> = Box::new(RedisSubscription {
                topic: topic.to_string(),
                messages: pubsub.into_on_message().boxed(),
            });
            Ok(sub)
        })
    }
}

struct RedisSubscription {
    topic: String,
    messages: BoxStream<'static, Msg>,
}

impl Subscription for RedisSubscription {
    fn recv(&mut self) -> BoxFuture<'_, Option<Vec<u8>>> {
        Box::pin(async move {
            match self.messages.next().await {
                Some(msg) => Some(msg.get_payload_bytes().to_vec()),
                None => {
                    warn!(topic = %self.topic, "redis subscription ended");
                    None
                }
            }
        })
    }
}
