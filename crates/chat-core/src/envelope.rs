//! The envelope: the only entity exchanged between client, router, bus and stores.
//!
//! Wire shape (JSON):
//! `{id, text, sender, receiver, type, timestamp}` with `timestamp` as RFC 3339.
//! A replayed backlog entry additionally carries `"history": true`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Sender label used for session notices.
pub const SYSTEM_SENDER: &str = "System";

/// Sender label used for error envelopes addressed to a single connection.
pub const SERVER_SENDER: &str = "server";

/// Envelope kind tag. Determines how the router treats the envelope.
///
/// Unrecognised tags decode into [`EnvelopeKind::Unknown`] instead of failing,
/// so a client speaking a newer protocol does not lose its connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EnvelopeKind {
    Chat,
    Join,
    Leave,
    Error,
    SessionStart,
    SessionEnd,
    Unknown(String),
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Chat => "chat",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Error => "error",
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::Unknown(tag) => tag,
        }
    }

    /// Notices generated by the server rather than typed by a user.
    pub fn is_system(&self) -> bool {
        matches!(self, Self::SessionStart | Self::SessionEnd | Self::Error)
    }
}

impl From<String> for EnvelopeKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "chat" => Self::Chat,
            "join" => Self::Join,
            "leave" => Self::Leave,
            "error" => Self::Error,
            "session_start" => Self::SessionStart,
            "session_end" => Self::SessionEnd,
            _ => Self::Unknown(tag),
        }
    }
}

impl From<EnvelopeKind> for String {
    fn from(kind: EnvelopeKind) -> String {
        match kind {
            EnvelopeKind::Unknown(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat or system message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque id, used by clients for display and dedup only.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sender: String,
    /// A user id, or a shared scope such as a room.
    #[serde(default)]
    pub receiver: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Assigned by the receiving node. Whatever the client sent is discarded.
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Set on backlog entries replayed at join time.
    #[serde(default, skip_serializing_if = "is_false")]
    pub history: bool,
}

impl Envelope {
    fn new(kind: EnvelopeKind, sender: &str, receiver: &str, text: &str) -> Self {
        Self {
            id: String::new(),
            text: text.to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            kind,
            timestamp: Utc::now(),
            history: false,
        }
    }

    pub fn chat(sender: &str, receiver: &str, text: &str) -> Self {
        let mut env = Self::new(EnvelopeKind::Chat, sender, receiver, text);
        env.id = generate_message_id();
        env
    }

    pub fn join(user: &str) -> Self {
        Self::new(EnvelopeKind::Join, user, "", "")
    }

    pub fn leave(user: &str) -> Self {
        Self::new(EnvelopeKind::Leave, user, "", "")
    }

    /// A `session_start` / `session_end` notice from the system, addressed to everyone.
    pub fn notice(kind: EnvelopeKind, text: &str) -> Self {
        Self::new(kind, SYSTEM_SENDER, "", text)
    }

    /// An error addressed to a single connection.
    pub fn error(receiver: &str, text: &str) -> Self {
        Self::new(EnvelopeKind::Error, SERVER_SENDER, receiver, text)
    }

    /// Overwrite the timestamp with the current time.
    pub fn stamp(&mut self) {
        self.timestamp = Utc::now();
    }

    /// Copy of this envelope tagged as replayed backlog.
    pub fn as_history(&self) -> Self {
        let mut env = self.clone();
        env.history = true;
        env
    }
}

/// Generate a random message id (hex-encoded, 8 bytes = 16 hex chars).
pub fn generate_message_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Accept any timestamp value; fall back to now when it is absent or unparseable.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_wire_names() {
        for (kind, tag) in [
            (EnvelopeKind::Chat, "chat"),
            (EnvelopeKind::Join, "join"),
            (EnvelopeKind::Leave, "leave"),
            (EnvelopeKind::Error, "error"),
            (EnvelopeKind::SessionStart, "session_start"),
            (EnvelopeKind::SessionEnd, "session_end"),
        ] {
            assert_eq!(String::from(kind.clone()), tag);
            assert_eq!(EnvelopeKind::from(tag.to_string()), kind);
        }
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let kind = EnvelopeKind::from("typing".to_string());
        assert_eq!(kind, EnvelopeKind::Unknown("typing".into()));
        assert_eq!(kind.to_string(), "typing");
    }

    #[test]
    fn missing_fields_default() {
        let env: Envelope = serde_json::from_str(r#"{"type":"join","text":"alice"}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Join);
        assert_eq!(env.text, "alice");
        assert!(env.sender.is_empty());
        assert!(!env.history);
    }

    #[test]
    fn bad_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let env: Envelope =
            serde_json::from_str(r#"{"type":"chat","timestamp":"yesterday"}"#).unwrap();
        assert!(env.timestamp >= before);
    }

    #[test]
    fn history_flag_only_serialized_when_set() {
        let env = Envelope::chat("alice", "bob", "hi");
        let live = serde_json::to_value(&env).unwrap();
        assert!(live.get("history").is_none());
        let replayed = serde_json::to_value(env.as_history()).unwrap();
        assert_eq!(replayed["history"], true);
    }

    #[test]
    fn chat_constructor_assigns_id() {
        let a = Envelope::chat("alice", "bob", "hi");
        let b = Envelope::chat("alice", "bob", "hi");
        assert_eq!(a.id.len(), 16);
        assert_ne!(a.id, b.id);
    }
}
