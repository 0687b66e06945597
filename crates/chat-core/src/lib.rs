//! chat-core: shared library for the realtime chat relay.
//!
//! Provides the wire envelope and its JSON codec, the history scope rules,
//! the backing-store contract (list store + pub/sub) with in-memory and
//! Redis backends, and the bounded History Store built on top of it.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod history;
pub mod scope;
pub mod store;

// Re-export commonly used items at crate root.
pub use codec::{decode_envelope, decode_envelope_bytes, encode_envelope};
pub use envelope::{generate_message_id, Envelope, EnvelopeKind, SERVER_SENDER, SYSTEM_SENDER};
pub use error::{ChatError, ChatResult};
pub use history::{HistoryStore, DEFAULT_HISTORY_LEN};
pub use scope::{HistoryMode, DEFAULT_ROOM_KEY};
pub use store::{ListStore, MemoryStore, PubSub, RedisStore, Subscription};
