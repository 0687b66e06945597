//! Service seams and their HTTP clients.
//!
//! The persistence service accepts `POST /persist-message` with a JSON
//! envelope; the query service answers `GET /message-history/{receiver}`
//! with `{"messages": [...]}`. Room chat is stored and read back under the
//! room key, which relayed room envelopes carry as their receiver.

use chat_core::store::BoxFuture;
use chat_core::{ChatError, ChatResult, Envelope, HistoryMode, HistoryStore};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Write side of the persistence service.
pub trait PersistSink: Send + Sync {
    fn persist<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, ChatResult<()>>;
}

/// Read side: a user's stored backlog, newest first.
pub trait HistorySource: Send + Sync {
    fn fetch<'a>(&'a self, user: &'a str) -> BoxFuture<'a, ChatResult<Vec<Envelope>>>;
}

fn build_http_client(timeout: Duration) -> ChatResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ChatError::Upstream(format!("http client: {e}")))
}

fn map_http_error(e: reqwest::Error) -> ChatError {
    if e.is_timeout() {
        ChatError::Timeout
    } else {
        ChatError::Upstream(e.to_string())
    }
}

fn endpoint(base: &str, segments: &[&str]) -> ChatResult<reqwest::Url> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| ChatError::Upstream(format!("bad service url {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| ChatError::Upstream(format!("service url cannot be a base: {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// HTTP client for `POST /persist-message`.
pub struct PersistClient {
    url: reqwest::Url,
    http_client: reqwest::Client,
}

impl PersistClient {
    pub fn new(base_url: &str, timeout: Duration) -> ChatResult<Self> {
        Ok(Self {
            url: endpoint(base_url, &["persist-message"])?,
            http_client: build_http_client(timeout)?,
        })
    }
}

impl PersistSink for PersistClient {
    fn persist<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, ChatResult<()>> {
        Box::pin(async move {
            let response = self
                .http_client
                .post(self.url.clone())
                .json(envelope)
                .send()
                .await
                .map_err(map_http_error)?;
            let status = response.status();
            if status.is_success() {
                debug!(id = %envelope.id, "message persisted");
                Ok(())
            } else if status.is_client_error() {
                Err(ChatError::Rejected(format!("persist-message returned {status}")))
            } else {
                Err(ChatError::Upstream(format!("persist-message returned {status}")))
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Option<Vec<Envelope>>,
}

/// HTTP client for `GET /message-history/{receiver}`.
///
/// In room mode every user reads the room's backlog, so the path names the
/// room key instead of the joining user.
pub struct QueryClient {
    base_url: String,
    mode: HistoryMode,
    room_key: String,
    http_client: reqwest::Client,
}

impl QueryClient {
    pub fn new(base_url: &str, timeout: Duration, mode: HistoryMode, room_key: &str) -> ChatResult<Self> {
        // Validate once up front; per-user URLs are built on each fetch.
        endpoint(base_url, &["message-history"])?;
        Ok(Self {
            base_url: base_url.to_string(),
            mode,
            room_key: room_key.to_string(),
            http_client: build_http_client(timeout)?,
        })
    }

    fn receiver_for<'a>(&'a self, user: &'a str) -> &'a str {
        if self.mode.is_room() {
            &self.room_key
        } else {
            user
        }
    }
}

impl HistorySource for QueryClient {
    fn fetch<'a>(&'a self, user: &'a str) -> BoxFuture<'a, ChatResult<Vec<Envelope>>> {
        Box::pin(async move {
            let url = endpoint(&self.base_url, &["message-history", self.receiver_for(user)])?;
            let response = self
                .http_client
                .get(url)
                .send()
                .await
                .map_err(map_http_error)?;
            let status = response.status();
            if !status.is_success() {
                return Err(ChatError::Upstream(format!("message-history returned {status}")));
            }
            let body: HistoryResponse = response.json().await.map_err(map_http_error)?;
            Ok(body.messages.unwrap_or_default())
        })
    }
}

/// Replay from this node's own History Store.
pub struct LocalHistory {
    history: Arc<HistoryStore>,
    mode: HistoryMode,
    room_key: String,
    limit: usize,
}

impl LocalHistory {
    pub fn new(history: Arc<HistoryStore>, mode: HistoryMode, room_key: &str, limit: usize) -> Self {
        Self {
            history,
            mode,
            room_key: room_key.to_string(),
            limit,
        }
    }
}

impl HistorySource for LocalHistory {
    fn fetch<'a>(&'a self, user: &'a str) -> BoxFuture<'a, ChatResult<Vec<Envelope>>> {
        Box::pin(async move {
            let scope = self.mode.key_for_receiver(&self.room_key, user);
            self.history.range(&scope, 0, self.limit).await
        })
    }
}
