//! Relay node: accepts WebSocket connections and runs one session task per
//! connection.
//!
//! Owns the connection registry, broadcast bus, history store and the two
//! gateways, and wires them into the [`Router`]. Each session task reads
//! frames, routes them, and drains its own delivery mailbox.

use crate::config::ServerConfig;
use crate::gateway::{
    HistoryGateway, HistorySource, LocalHistory, PersistClient, PersistenceGateway, QueryClient,
    RetryPolicy,
};
use crate::relay::{BroadcastBus, ConnectionMailbox, ConnectionRegistry, MailboxEvent};
use crate::router::{ConnectionState, Outcome, Router};
use crate::transport::websocket::{self, WebSocketConnection};
use chat_core::{
    decode_envelope, encode_envelope, ChatError, ChatResult, Envelope, EnvelopeKind, HistoryStore,
    ListStore, PubSub,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// The chat relay node.
pub struct ChatServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    bus: Arc<BroadcastBus>,
    router: Router,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl ChatServer {
    /// Build a node over `backend`, which provides both history lists and the
    /// bus topic. Must be called inside a tokio runtime: the persistence
    /// dispatch task starts here.
    pub fn new<B>(config: ServerConfig, backend: Arc<B>) -> ChatResult<Self>
    where
        B: ListStore + PubSub + 'static,
    {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = Arc::new(BroadcastBus::new(backend.clone(), config.bus_topic.clone()));
        let history = Arc::new(HistoryStore::new(backend, config.history_max_len));

        let persist = match &config.persist {
            Some(settings) => {
                let client = PersistClient::new(&settings.url, settings.timeout)?;
                let policy = RetryPolicy {
                    max_attempts: settings.max_attempts,
                    base_backoff: settings.backoff,
                    attempt_timeout: settings.timeout,
                };
                info!(url = %settings.url, "persistence gateway enabled");
                let (gateway, _dispatch) =
                    PersistenceGateway::spawn(Arc::new(client), policy, settings.queue_capacity);
                Some(gateway)
            }
            None => {
                info!("no persistence service configured");
                None
            }
        };

        let (source, fetch_timeout): (Arc<dyn HistorySource>, _) = match &config.query {
            Some(settings) => {
                info!(url = %settings.url, "replaying history from query service");
                let client = QueryClient::new(
                    &settings.url,
                    settings.timeout,
                    config.history_mode,
                    &config.room_key,
                )?;
                (Arc::new(client) as Arc<dyn HistorySource>, settings.timeout)
            }
            None => {
                let local = LocalHistory::new(
                    history.clone(),
                    config.history_mode,
                    &config.room_key,
                    config.replay_limit,
                );
                (Arc::new(local) as Arc<dyn HistorySource>, config.store_timeout)
            }
        };
        let history_gateway = Arc::new(HistoryGateway::new(
            source,
            registry.clone(),
            fetch_timeout,
            config.write_timeout,
        ));

        let router = Router::new(
            &config,
            registry.clone(),
            bus.clone(),
            history,
            history_gateway,
            persist,
        );

        Ok(Self {
            config,
            registry,
            bus,
            router,
            shutdown_tx: broadcast::channel(1).0,
        })
    }

    /// Bind the WebSocket listener.
    pub async fn listen(&self) -> ChatResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| ChatError::Other(format!("invalid address: {e}")))?;
        websocket::start_listener(addr).await
    }

    /// Listen on the configured address and serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> ChatResult<()> {
        let (_addr, connections) = self.listen().await?;
        self.serve(connections, shutdown).await
    }

    /// Serve accepted connections until `shutdown` resolves, then tell every
    /// live connection and wait (bounded) for the sessions to finish.
    pub async fn serve(
        self,
        mut connections: mpsc::Receiver<WebSocketConnection>,
        shutdown: impl Future<Output = ()>,
    ) -> ChatResult<()> {
        let server = Arc::new(self);
        let subscriber = server
            .bus
            .spawn_subscriber(server.registry.clone(), server.config.history_mode)
            .await?;

        info!(
            mode = ?server.config.history_mode,
            max_len = server.config.history_max_len,
            "chat-relay ready"
        );

        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                accepted = connections.recv() => {
                    let Some(conn) = accepted else {
                        info!("listener closed, shutting down");
                        break;
                    };
                    let srv = server.clone();
                    let shutdown_rx = server.shutdown_tx.subscribe();
                    sessions.spawn(async move {
                        let remote = conn.remote_addr;
                        if let Err(e) = srv.handle_connection(conn, shutdown_rx).await {
                            warn!(remote = %remote, error = %e, "WebSocket connection error");
                        }
                    });
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        // Broadcast shutdown to all connected clients
        info!(sessions = sessions.len(), "broadcasting shutdown to connected clients");
        let _ = server.shutdown_tx.send(());
        let drain = async { while sessions.join_next().await.is_some() {} };
        if tokio::time::timeout(server.config.write_timeout, drain).await.is_err() {
            warn!("sessions did not finish in time, aborting");
        }
        subscriber.abort();
        Ok(())
    }

    async fn handle_connection(
        &self,
        conn: WebSocketConnection,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> ChatResult<()> {
        let remote = conn.remote_addr;
        let mut ws = conn.ws_stream;
        let mut state = ConnectionState::new(self.registry.next_conn_id());
        info!(remote = %remote, conn_id = state.conn_id(), "connection opened");

        let result = self.session_loop(&mut ws, &mut state, shutdown_rx).await;

        self.router.disconnect(&mut state).await;
        let _ = ws.close(None).await;
        info!(remote = %remote, conn_id = state.conn_id(), "connection closed");
        result
    }

    async fn session_loop(
        &self,
        ws: &mut WebSocketStream<TcpStream>,
        state: &mut ConnectionState,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> ChatResult<()> {
        let mut mailbox: Option<ConnectionMailbox> = None;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(conn_id = state.conn_id(), "shutdown signal received, notifying client");
                    let notice = Envelope::notice(EnvelopeKind::SessionEnd, "server shutdown");
                    let _ = self.send(ws, &notice).await;
                    return Ok(());
                }

                event = next_delivery(&mut mailbox) => match event {
                    MailboxEvent::Deliver(envelope) => self.send(ws, &envelope).await?,
                    MailboxEvent::Closed => {
                        debug!(conn_id = state.conn_id(), "connection shed by registry");
                        return Ok(());
                    }
                },

                frame = websocket::ws_recv_text(ws, self.config.max_frame_bytes) => match frame {
                    Ok(Some(text)) => {
                        let envelope = match decode_envelope(&text) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!(conn_id = state.conn_id(), error = %e, "dropping malformed envelope");
                                continue;
                            }
                        };
                        match self.router.route(state, envelope).await {
                            Outcome::Continue => {}
                            Outcome::Reply(reply) => self.send(ws, &reply).await?,
                            Outcome::Joined(joined) => mailbox = Some(joined),
                            Outcome::Close => return Ok(()),
                        }
                    }
                    Ok(None) => {
                        debug!(conn_id = state.conn_id(), "WebSocket session ended (peer closed)");
                        return Ok(());
                    }
                    Err(ChatError::InvalidMessage(reason)) => {
                        warn!(conn_id = state.conn_id(), reason = %reason, "dropping frame");
                    }
                    Err(e) => {
                        debug!(conn_id = state.conn_id(), error = %e, "WebSocket session ended");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Write one envelope, giving up after the configured write timeout.
    async fn send(&self, ws: &mut WebSocketStream<TcpStream>, envelope: &Envelope) -> ChatResult<()> {
        let text = encode_envelope(envelope)?;
        tokio::time::timeout(self.config.write_timeout, websocket::ws_send_text(ws, text)).await?
    }
}

/// Next mailbox event, or never if the connection has not joined yet.
async fn next_delivery(mailbox: &mut Option<ConnectionMailbox>) -> MailboxEvent {
    match mailbox {
        Some(mailbox) => mailbox.next().await,
        None => std::future::pending().await,
    }
}
