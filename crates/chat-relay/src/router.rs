//! Router: classifies inbound envelopes and drives the per-connection
//! handshake (unjoined → joined → terminal).
//!
//! The router holds no per-connection state itself. Each connection task
//! owns a [`ConnectionState`] and hands it to [`Router::route`] together with
//! every decoded envelope, in arrival order. Because a connection's envelopes
//! are routed one at a time, a single sender's chat is stored, queued for
//! persistence and published in the order it arrived.

use crate::config::ServerConfig;
use crate::gateway::{HistoryGateway, PersistenceGateway};
use crate::relay::{BroadcastBus, ConnectionHandle, ConnectionMailbox, ConnectionRegistry};
use chat_core::{generate_message_id, Envelope, EnvelopeKind, HistoryMode, HistoryStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Error text sent when a join names a user id that is already connected.
pub const DUPLICATE_USER: &str = "User already exists";

/// Where a connection is in the join handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Unjoined,
    Joined(String),
    Terminal,
}

/// Per-connection routing state, owned by the connection task.
#[derive(Debug)]
pub struct ConnectionState {
    conn_id: u64,
    phase: Phase,
}

impl ConnectionState {
    pub fn new(conn_id: u64) -> Self {
        Self {
            conn_id,
            phase: Phase::Unjoined,
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// The joined user id, if any.
    pub fn user(&self) -> Option<&str> {
        match &self.phase {
            Phase::Joined(user) => Some(user),
            _ => None,
        }
    }
}

/// What the connection task must do after an envelope has been routed.
#[derive(Debug)]
pub enum Outcome {
    /// Nothing to send back.
    Continue,
    /// Send this envelope to the originating connection only.
    Reply(Envelope),
    /// The join succeeded: start draining this mailbox.
    Joined(ConnectionMailbox),
    /// Close the connection.
    Close,
}

pub struct Router {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<BroadcastBus>,
    history: Arc<HistoryStore>,
    history_gateway: Arc<HistoryGateway>,
    persist: Option<PersistenceGateway>,
    mode: HistoryMode,
    room_key: String,
    store_timeout: Duration,
    outbound_capacity: usize,
}

impl Router {
    pub fn new(
        config: &ServerConfig,
        registry: Arc<ConnectionRegistry>,
        bus: Arc<BroadcastBus>,
        history: Arc<HistoryStore>,
        history_gateway: Arc<HistoryGateway>,
        persist: Option<PersistenceGateway>,
    ) -> Self {
        Self {
            registry,
            bus,
            history,
            history_gateway,
            persist,
            mode: config.history_mode,
            room_key: config.room_key.clone(),
            store_timeout: config.store_timeout,
            outbound_capacity: config.outbound_capacity,
        }
    }

    /// Route one inbound envelope for the connection described by `state`.
    pub async fn route(&self, state: &mut ConnectionState, mut envelope: Envelope) -> Outcome {
        envelope.stamp();

        if state.phase == Phase::Terminal {
            debug!(conn_id = state.conn_id, kind = %envelope.kind, "envelope after close ignored");
            return Outcome::Close;
        }

        match envelope.kind.clone() {
            EnvelopeKind::Join => self.handle_join(state, envelope).await,
            EnvelopeKind::Chat => {
                self.handle_chat(state, envelope).await;
                Outcome::Continue
            }
            EnvelopeKind::Leave | EnvelopeKind::SessionEnd => {
                self.leave(state).await;
                Outcome::Close
            }
            kind if kind.is_system() => {
                warn!(conn_id = state.conn_id, kind = %kind, "client sent a server-only kind, dropping");
                Outcome::Continue
            }
            kind => {
                warn!(conn_id = state.conn_id, kind = %kind, "unknown envelope kind, dropping");
                Outcome::Continue
            }
        }
    }

    async fn handle_join(&self, state: &mut ConnectionState, envelope: Envelope) -> Outcome {
        if let Phase::Joined(user) = &state.phase {
            debug!(conn_id = state.conn_id, user = %user, "already joined, ignoring join");
            return Outcome::Continue;
        }

        let user = join_id(&envelope);
        if user.is_empty() {
            warn!(conn_id = state.conn_id, "join without a user id, dropping");
            return Outcome::Continue;
        }

        let (handle, mailbox) = ConnectionHandle::new(state.conn_id, self.outbound_capacity);
        if !self.registry.register(&user, handle).await {
            return Outcome::Reply(Envelope::error(&user, DUPLICATE_USER));
        }

        info!(conn_id = state.conn_id, user = %user, "user joined");
        self.history_gateway.spawn_replay(user.clone());
        self.bus
            .publish(&Envelope::notice(
                EnvelopeKind::SessionStart,
                &format!("{user} joined the chat"),
            ))
            .await;
        state.phase = Phase::Joined(user);
        Outcome::Joined(mailbox)
    }

    async fn handle_chat(&self, state: &ConnectionState, mut envelope: Envelope) {
        let Some(user) = state.user() else {
            warn!(conn_id = state.conn_id, "chat before join, dropping");
            return;
        };
        if envelope.receiver.is_empty() && !self.mode.is_room() {
            warn!(user = %user, "chat without receiver, dropping");
            return;
        }

        envelope.sender = user.to_string();
        if self.mode.is_room() {
            // Room chat is addressed to the room itself, wherever it is stored.
            envelope.receiver = self.room_key.clone();
        }
        if envelope.id.is_empty() {
            envelope.id = generate_message_id();
        }
        debug!(user = %user, receiver = %envelope.receiver, id = %envelope.id, "routing chat");

        let scope = self.mode.key_for_receiver(&self.room_key, &envelope.receiver);
        match tokio::time::timeout(self.store_timeout, self.history.append(&scope, &envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(scope = %scope, error = %e, "history append failed"),
            Err(_) => warn!(scope = %scope, "history append timed out"),
        }

        if let Some(persist) = &self.persist {
            persist.enqueue(envelope.clone());
        }

        self.bus.publish(&envelope).await;
    }

    /// Explicit leave: unregister, announce, and go terminal.
    async fn leave(&self, state: &mut ConnectionState) {
        if let Phase::Joined(user) = std::mem::replace(&mut state.phase, Phase::Terminal) {
            info!(conn_id = state.conn_id, user = %user, "user left");
            self.end_session(&user, state.conn_id).await;
        }
    }

    /// Transport closed or failed. Runs the same cleanup as an explicit
    /// leave; calling it after a leave does nothing.
    pub async fn disconnect(&self, state: &mut ConnectionState) {
        if let Phase::Joined(user) = std::mem::replace(&mut state.phase, Phase::Terminal) {
            info!(conn_id = state.conn_id, user = %user, "user disconnected");
            self.end_session(&user, state.conn_id).await;
        }
    }

    async fn end_session(&self, user: &str, conn_id: u64) {
        // The entry may already be gone if the registry shed this connection.
        self.registry.release(user, conn_id).await;
        self.bus
            .publish(&Envelope::notice(
                EnvelopeKind::SessionEnd,
                &format!("{user} left the chat"),
            ))
            .await;
    }
}

/// User id claimed by a join: `sender`, or `text` for older clients.
fn join_id(envelope: &Envelope) -> String {
    let id = if envelope.sender.trim().is_empty() {
        envelope.text.trim()
    } else {
        envelope.sender.trim()
    };
    id.to_string()
}
