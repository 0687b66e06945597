//! Broadcast bus: makes an envelope visible to every node's registry.
//!
//! A node publishes the encoded envelope to one shared topic. Every node,
//! the publisher included, runs a subscriber that hands each payload to its
//! own [`ConnectionRegistry`]. Publishing is fire-and-forget: there is no
//! acknowledgement from the receiver, and a receiver that is not connected
//! anywhere only sees the message later through history replay.

use super::registry::{ConnectionRegistry, DeliveryResult};
use chat_core::{decode_envelope_bytes, encode_envelope, ChatResult, Envelope, HistoryMode, PubSub};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct BroadcastBus {
    pubsub: Arc<dyn PubSub>,
    topic: String,
}

impl BroadcastBus {
    pub fn new(pubsub: Arc<dyn PubSub>, topic: impl Into<String>) -> Self {
        Self {
            pubsub,
            topic: topic.into(),
        }
    }

    /// Publish an envelope to all nodes. Failures are logged, never returned.
    pub async fn publish(&self, envelope: &Envelope) {
        let payload = match encode_envelope(envelope) {
            Ok(text) => text.into_bytes(),
            Err(e) => {
                warn!(error = %e, id = %envelope.id, "cannot encode envelope for bus");
                return;
            }
        };
        match self.pubsub.publish(&self.topic, payload).await {
            Ok(reached) => debug!(topic = %self.topic, kind = %envelope.kind, reached, "envelope published"),
            Err(e) => warn!(topic = %self.topic, error = %e, "bus publish failed"),
        }
    }

    /// Subscribe to the topic and spawn the task feeding this node's registry.
    ///
    /// The subscription is live when this returns, so anything published
    /// afterwards reaches the registry.
    pub async fn spawn_subscriber(
        &self,
        registry: Arc<ConnectionRegistry>,
        mode: HistoryMode,
    ) -> ChatResult<JoinHandle<()>> {
        let mut subscription = self.pubsub.subscribe(&self.topic).await?;
        let topic = self.topic.clone();
        info!(topic = %topic, "bus subscriber started");

        Ok(tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                match decode_envelope_bytes(&payload) {
                    Ok(envelope) => deliver_local(&registry, envelope, mode).await,
                    Err(e) => warn!(topic = %topic, error = %e, "dropping undecodable bus payload"),
                }
            }
            info!(topic = %topic, "bus subscription closed");
        }))
    }
}

/// Hand one bus envelope to the local registry.
///
/// Room chat and notices without a receiver go to every local connection;
/// anything else goes to its receiver only.
pub async fn deliver_local(registry: &ConnectionRegistry, envelope: Envelope, mode: HistoryMode) {
    if mode.is_room() || envelope.receiver.is_empty() {
        let delivered = registry.deliver_all(&envelope).await;
        debug!(kind = %envelope.kind, delivered, "fan-out to local connections");
        return;
    }
    let receiver = envelope.receiver.clone();
    match registry.deliver(&receiver, envelope).await {
        DeliveryResult::Delivered => debug!(receiver = %receiver, "delivered"),
        DeliveryResult::Offline => debug!(receiver = %receiver, "receiver not on this node"),
        DeliveryResult::Dead => debug!(receiver = %receiver, "receiver shed"),
    }
}
