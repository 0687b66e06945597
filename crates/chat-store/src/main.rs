//! chat-store: persistence and query service for chat history.
//!
//! Stores every envelope it is sent under its receiver's mailbox, capped at
//! `--max-len` entries, and serves the mailbox back newest-first. With
//! `--store-url` the mailboxes live in Redis, shared with the relay nodes.

mod api;

use anyhow::{Context, Result};
use api::StoreState;
use chat_core::{HistoryStore, ListStore, MemoryStore, RedisStore, DEFAULT_HISTORY_LEN};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// chat-store: chat history service
#[derive(Parser, Debug)]
#[command(name = "chat-store", version, about = "Chat persistence and query service")]
struct Cli {
    /// Listen port
    #[arg(short, long, default_value_t = 8081)]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Maximum messages kept per receiver
    #[arg(long, default_value_t = DEFAULT_HISTORY_LEN)]
    max_len: usize,

    /// Shared backing store, e.g. redis://127.0.0.1:6379 (in-process when unset)
    #[arg(long)]
    store_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cli.bind, cli.port))?;

    let backend: Arc<dyn ListStore> = match cli.store_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => Arc::new(
            RedisStore::connect(url)
                .await
                .context("failed to connect to backing store")?,
        ),
        None => {
            info!("no backing store configured, history stays in process");
            Arc::new(MemoryStore::new())
        }
    };
    let history = Arc::new(HistoryStore::new(backend, cli.max_len.max(1)));
    let app = api::app(StoreState::new(history));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %listener.local_addr()?,
        max_len = cli.max_len,
        "chat-store listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("chat-store stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
