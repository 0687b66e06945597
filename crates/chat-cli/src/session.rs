//! Interactive session: join, then pump stdin to the relay and relay
//! deliveries to stdout.

use crate::render::format_envelope;
use anyhow::{Context, Result};
use chat_core::{decode_envelope, encode_envelope, Envelope};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// What a typed line asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Quit,
    Skip,
    Chat(&'a str),
}

pub fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim() == "/quit" {
        Input::Quit
    } else if line.trim().is_empty() {
        Input::Skip
    } else {
        Input::Chat(line)
    }
}

/// Join `url` as `user` and chat with `to` until `/quit`, EOF, or the relay
/// closes the connection.
pub async fn run(url: &str, user: &str, to: &str) -> Result<()> {
    let (ws_stream, _response) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!(url = %url, user = %user, "connected");

    let (mut sink, mut stream) = ws_stream.split();
    send(&mut sink, &Envelope::join(user)).await?;

    let mut printer = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match decode_envelope(&text) {
                    Ok(envelope) => println!("{}", format_envelope(&envelope)),
                    Err(e) => warn!(error = %e, "undecodable frame from relay"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "connection error");
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut printer => {
                eprintln!("chat: connection closed by relay");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_input(&line) {
                    Input::Quit => break,
                    Input::Skip => continue,
                    Input::Chat(text) => send(&mut sink, &Envelope::chat(user, to, text)).await?,
                }
            }
        }
    }

    send(&mut sink, &Envelope::leave(user)).await?;
    let _ = sink.close().await;
    printer.abort();
    Ok(())
}

async fn send(sink: &mut WsSink, envelope: &Envelope) -> Result<()> {
    let text = encode_envelope(envelope)?;
    sink.send(Message::Text(text.into()))
        .await
        .context("failed to send to relay")
}
