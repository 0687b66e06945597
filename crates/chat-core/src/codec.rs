//! JSON text-frame codec for envelopes.
//!
//! Every frame on the realtime transport and every payload on the broadcast
//! bus and in the history lists is one JSON-encoded [`Envelope`].

use crate::envelope::Envelope;
use crate::error::{ChatError, ChatResult};

/// Encode an envelope into its JSON wire form.
pub fn encode_envelope(envelope: &Envelope) -> ChatResult<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a JSON text frame into an envelope.
pub fn decode_envelope(text: &str) -> ChatResult<Envelope> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InvalidMessage("empty frame".into()));
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Decode raw bytes (bus payloads, stored list entries).
pub fn decode_envelope_bytes(data: &[u8]) -> ChatResult<Envelope> {
    let text = std::str::from_utf8(data)
        .map_err(|e| ChatError::Codec(format!("payload is not UTF-8: {e}")))?;
    decode_envelope(text)
}
