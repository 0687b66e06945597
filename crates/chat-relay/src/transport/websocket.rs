//! WebSocket listener using tokio-tungstenite.
//!
//! Each accepted connection carries one JSON envelope per text frame.

use chat_core::{ChatError, ChatResult};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// accepted connections. The accept loop stops once the receiver is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> ChatResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ChatError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket accept loop stopped");
    });

    Ok((local_addr, rx))
}

/// Send one text frame.
pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: String) -> ChatResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| ChatError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next text frame.
///
/// Returns `None` once the peer closes. Pings are answered and binary frames
/// skipped. A text frame over `max_frame_bytes` yields
/// [`ChatError::InvalidMessage`]; the connection itself stays usable.
pub async fn ws_recv_text(
    ws: &mut WebSocketStream<TcpStream>,
    max_frame_bytes: usize,
) -> ChatResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > max_frame_bytes {
                    return Err(ChatError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {})",
                        text.len(),
                        max_frame_bytes
                    )));
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Binary(data))) => {
                debug!(len = data.len(), "ignoring binary frame");
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(ChatError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
