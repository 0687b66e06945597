//! History scope keys.
//!
//! A deployment runs either as one shared room (every chat is stored under a
//! single list) or as per-user mailboxes (`messages:<receiver>`).

use serde::{Deserialize, Serialize};

/// List key used for the shared room when none is configured.
pub const DEFAULT_ROOM_KEY: &str = "chat_messages";

/// Prefix of per-receiver mailbox keys.
pub const MAILBOX_PREFIX: &str = "messages:";

/// How history is bucketed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    /// One global room: all chat is stored together and fanned out to everyone.
    Room,
    /// One list per receiver; chat is delivered to the receiver only.
    #[default]
    Mailbox,
}

impl HistoryMode {
    /// Key under which a chat addressed to `receiver` is stored.
    pub fn key_for_receiver(&self, room_key: &str, receiver: &str) -> String {
        match self {
            Self::Room => room_key.to_string(),
            Self::Mailbox => mailbox_key(receiver),
        }
    }

    pub fn is_room(&self) -> bool {
        matches!(self, Self::Room)
    }
}

impl std::str::FromStr for HistoryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "room" => Ok(Self::Room),
            "mailbox" => Ok(Self::Mailbox),
            other => Err(format!("unknown history mode: {other} (expected room or mailbox)")),
        }
    }
}

pub fn mailbox_key(receiver: &str) -> String {
    format!("{MAILBOX_PREFIX}{receiver}")
}
