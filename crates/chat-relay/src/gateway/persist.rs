//! Persistence gateway: forwards chat envelopes to the persistence service
//! from a background task so the delivery path never waits on it.
//!
//! Envelopes are queued on a bounded channel and forwarded one at a time, in
//! submission order. Each envelope gets at most `max_attempts` tries with
//! exponential backoff, every try capped by `attempt_timeout`; after that it
//! is dropped. A rejection (the service refusing the envelope itself) drops
//! it at once. A full queue drops the new envelope immediately, so a long
//! outage costs lost persistence, never unbounded memory.

use super::upstream::PersistSink;
use chat_core::{ChatError, Envelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest backoff multiplier (2^6).
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.base_backoff.saturating_mul(1 << shift)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            attempt_timeout: Duration::from_secs(3),
        }
    }
}

pub struct PersistenceGateway {
    tx: mpsc::Sender<Envelope>,
}

impl PersistenceGateway {
    /// Start the dispatch task. It ends once the gateway is dropped and the
    /// queue has drained.
    pub fn spawn(
        sink: Arc<dyn PersistSink>,
        policy: RetryPolicy,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));
        let task = tokio::spawn(async move {
            info!(max_attempts = policy.max_attempts, "persistence dispatch started");
            while let Some(envelope) = rx.recv().await {
                forward_with_retry(sink.as_ref(), &envelope, &policy).await;
            }
            debug!("persistence dispatch stopped");
        });
        (Self { tx }, task)
    }

    /// Submit an envelope without waiting. Returns `false` if it was dropped.
    pub fn enqueue(&self, envelope: Envelope) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(envelope)) => {
                warn!(id = %envelope.id, "persistence queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(envelope)) => {
                warn!(id = %envelope.id, "persistence dispatch gone, dropping message");
                false
            }
        }
    }
}

/// Forward one envelope under the retry policy. Returns whether it was stored.
pub async fn forward_with_retry(sink: &dyn PersistSink, envelope: &Envelope, policy: &RetryPolicy) -> bool {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let result = match tokio::time::timeout(policy.attempt_timeout, sink.persist(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::Timeout),
        };
        match result {
            Ok(()) => {
                debug!(id = %envelope.id, attempt, "forwarded to persistence service");
                return true;
            }
            Err(e) if !e.is_retryable() => {
                warn!(id = %envelope.id, attempt, error = %e, "persist rejected, dropping");
                return false;
            }
            Err(e) if attempt < attempts => {
                let delay = policy.backoff(attempt);
                warn!(id = %envelope.id, attempt, error = %e, retry_in_ms = delay.as_millis() as u64, "persist failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(id = %envelope.id, attempt, error = %e, "persist failed, giving up");
            }
        }
    }
    false
}
