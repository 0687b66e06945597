use thiserror::Error;

/// Errors produced by the chat relay components.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    /// The remote side refused the request itself; sending it again won't help.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ChatError {
    /// Whether the same request may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Rejected(_) | Self::InvalidMessage(_) | Self::Codec(_)
        )
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Codec(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ChatError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ChatError::Timeout
    }
}

impl From<redis::RedisError> for ChatError {
    fn from(e: redis::RedisError) -> Self {
        ChatError::Store(e.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
