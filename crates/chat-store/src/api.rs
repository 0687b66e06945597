//! HTTP surface of the store service.
//!
//! `POST /persist-message` appends an envelope to its receiver's mailbox and
//! `GET /message-history/:receiver` reads it back newest-first. Relays in
//! room mode address room chat to the room key, so a room is just another
//! receiver here. Both go
//! through the bounded [`HistoryStore`], so no mailbox ever exceeds its cap.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chat_core::scope::mailbox_key;
use chat_core::{Envelope, HistoryStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct StoreState {
    history: Arc<HistoryStore>,
}

impl StoreState {
    pub fn new(history: Arc<HistoryStore>) -> Self {
        Self { history }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<Envelope>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

pub fn app(state: StoreState) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/persist-message", post(persist_message))
        .route("/message-history/:receiver", get(message_history))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

async fn persist_message(
    State(state): State<StoreState>,
    payload: Result<Json<Envelope>, JsonRejection>,
) -> impl IntoResponse {
    let envelope = match payload {
        Ok(Json(envelope)) if !envelope.receiver.trim().is_empty() => envelope,
        Ok(_) => {
            warn!("persist request without receiver");
            return invalid_input();
        }
        Err(rejection) => {
            warn!(error = %rejection, "persist request rejected");
            return invalid_input();
        }
    };

    match state.history.append(&mailbox_key(&envelope.receiver), &envelope).await {
        Ok(()) => {
            debug!(id = %envelope.id, receiver = %envelope.receiver, "message persisted");
            (StatusCode::OK, Json(json!({ "message": "Message Persisted" }))).into_response()
        }
        Err(e) => {
            warn!(receiver = %envelope.receiver, error = %e, "persist failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to persist message" })),
            )
                .into_response()
        }
    }
}

async fn message_history(
    State(state): State<StoreState>,
    Path(receiver): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(state.history.max_len());
    match state
        .history
        .range(&mailbox_key(&receiver), query.offset, limit)
        .await
    {
        Ok(messages) => {
            debug!(receiver = %receiver, count = messages.len(), "history read");
            (StatusCode::OK, Json(HistoryResponse { messages })).into_response()
        }
        Err(e) => {
            warn!(receiver = %receiver, error = %e, "history read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to read messages" })),
            )
                .into_response()
        }
    }
}

fn invalid_input() -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Invalid input" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::store::{BoxFuture, ListStore};
    use chat_core::{ChatError, ChatResult, MemoryStore};
    use serde_json::Value;
    use std::net::SocketAddr;

    /// A list store whose backend is always down.
    struct BrokenStore;

    impl ListStore for BrokenStore {
        fn push_front<'a>(&'a self, _key: &'a str, _value: Vec<u8>) -> BoxFuture<'a, ChatResult<()>> {
            Box::pin(async { Err(ChatError::Store("connection refused".into())) })
        }

        fn trim<'a>(&'a self, _key: &'a str, _max_len: usize) -> BoxFuture<'a, ChatResult<()>> {
            Box::pin(async { Err(ChatError::Store("connection refused".into())) })
        }

        fn range<'a>(
            &'a self,
            _key: &'a str,
            _offset: usize,
            _limit: usize,
        ) -> BoxFuture<'a, ChatResult<Vec<Vec<u8>>>> {
            Box::pin(async { Err(ChatError::Store("connection refused".into())) })
        }

        fn len<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, ChatResult<usize>> {
            Box::pin(async { Err(ChatError::Store("connection refused".into())) })
        }
    }

    async fn spawn_app(store: Arc<dyn ListStore>, max_len: usize) -> SocketAddr {
        let state = StoreState::new(Arc::new(HistoryStore::new(store, max_len)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(state)).await.unwrap();
        });
        addr
    }

    async fn persist(client: &reqwest::Client, addr: SocketAddr, body: String) -> (u16, Value) {
        let response = client
            .post(format!("http://{addr}/persist-message"))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn history(client: &reqwest::Client, addr: SocketAddr, path: &str) -> (u16, Value) {
        let response = client
            .get(format!("http://{addr}/message-history/{path}"))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn persist_then_read_back() {
        let addr = spawn_app(Arc::new(MemoryStore::new()), 300).await;
        let client = reqwest::Client::new();

        for text in ["first", "second"] {
            let body = serde_json::to_string(&Envelope::chat("alice", "bob", text)).unwrap();
            let (status, reply) = persist(&client, addr, body).await;
            assert_eq!(status, 200);
            assert_eq!(reply["message"], "Message Persisted");
        }

        let (status, reply) = history(&client, addr, "bob").await;
        assert_eq!(status, 200);
        let texts: Vec<&str> = reply["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn room_backlog_is_kept_under_the_room_key() {
        let addr = spawn_app(Arc::new(MemoryStore::new()), 300).await;
        let client = reqwest::Client::new();

        for sender in ["alice", "bob"] {
            let body = serde_json::to_string(&Envelope::chat(sender, "chat_messages", "hi all")).unwrap();
            assert_eq!(persist(&client, addr, body).await.0, 200);
        }

        let (_, reply) = history(&client, addr, "chat_messages").await;
        let senders: Vec<&str> = reply["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["sender"].as_str().unwrap())
            .collect();
        assert_eq!(senders, vec!["bob", "alice"]);
        let (_, reply) = history(&client, addr, "bob").await;
        assert!(reply["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_receiver_has_empty_history() {
        let addr = spawn_app(Arc::new(MemoryStore::new()), 300).await;
        let (status, reply) = history(&reqwest::Client::new(), addr, "nobody").await;
        assert_eq!(status, 200);
        assert_eq!(reply["messages"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let addr = spawn_app(Arc::new(MemoryStore::new()), 300).await;
        let client = reqwest::Client::new();

        let (status, reply) = persist(&client, addr, "{not json".into()).await;
        assert_eq!(status, 400);
        assert_eq!(reply["error"], "Invalid input");

        let (status, _) = persist(&client, addr, r#"{"text":"hi","type":"chat"}"#.into()).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn history_is_capped_and_paged() {
        let addr = spawn_app(Arc::new(MemoryStore::new()), 5).await;
        let client = reqwest::Client::new();
        for i in 0..8 {
            let body = serde_json::to_string(&Envelope::chat("alice", "bob", &i.to_string())).unwrap();
            assert_eq!(persist(&client, addr, body).await.0, 200);
        }

        let (_, reply) = history(&client, addr, "bob").await;
        let all = reply["messages"].as_array().unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0]["text"], "7");
        assert_eq!(all[4]["text"], "3");

        let (_, reply) = history(&client, addr, "bob?offset=1&limit=2").await;
        let page: Vec<&str> = reply["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["text"].as_str().unwrap())
            .collect();
        assert_eq!(page, vec!["6", "5"]);
    }

    #[tokio::test]
    async fn store_failure_is_500() {
        let addr = spawn_app(Arc::new(BrokenStore), 300).await;
        let client = reqwest::Client::new();

        let body = serde_json::to_string(&Envelope::chat("alice", "bob", "lost")).unwrap();
        let (status, reply) = persist(&client, addr, body).await;
        assert_eq!(status, 500);
        assert_eq!(reply["error"], "Failed to persist message");

        assert_eq!(history(&client, addr, "bob").await.0, 500);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let addr = spawn_app(Arc::new(MemoryStore::new()), 300).await;
        let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }
}
