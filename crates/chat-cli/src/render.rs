//! Terminal rendering of inbound envelopes.

use chat_core::{Envelope, EnvelopeKind};
use chrono::SecondsFormat;

/// One display line: `[RFC3339] sender: text`.
///
/// Replayed backlog is marked `(history)`; errors from the relay are shown
/// as `error:` so they stand out from chat.
pub fn format_envelope(envelope: &Envelope) -> String {
    let timestamp = envelope.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    let marker = if envelope.history { " (history)" } else { "" };
    match envelope.kind {
        EnvelopeKind::Error => format!("[{timestamp}] error: {}", envelope.text),
        _ => format!("[{timestamp}]{marker} {}: {}", envelope.sender, envelope.text),
    }
}
