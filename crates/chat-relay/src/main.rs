//! chat-relay: realtime chat relay node.
//!
//! Accepts WebSocket connections, registers joined users, and routes chat
//! to receivers on this and every other node sharing the same backing store
//! (a Redis server given by `--store-url`, or in-process when unset).
//! Chat is kept in a bounded history and, optionally, forwarded to a remote
//! persistence service.

mod config;
mod gateway;
mod relay;
mod router;
mod server;
mod transport;

use chat_core::{HistoryMode, MemoryStore, RedisStore};
use clap::Parser;
use config::ServerConfig;
use server::ChatServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// chat-relay: realtime chat relay
#[derive(Parser, Debug)]
#[command(name = "chat-relay", version, about = "Realtime chat relay")]
struct Cli {
    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.chat-relay/config.toml")]
    config: String,

    /// History mode: room or mailbox
    #[arg(long)]
    mode: Option<HistoryMode>,

    /// Base URL of the persistence service
    #[arg(long)]
    persist_url: Option<String>,

    /// Base URL of the query service
    #[arg(long)]
    query_url: Option<String>,

    /// Shared backing store, e.g. redis://127.0.0.1:6379 (overrides config)
    #[arg(long)]
    store_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting chat-relay");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.bind.as_deref(),
        cli.mode,
        cli.persist_url.as_deref(),
        cli.query_url.as_deref(),
        cli.store_url.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        bind = %server_config.bind,
        port = server_config.port,
        mode = ?server_config.history_mode,
        "config loaded"
    );

    let created = match server_config.store_url.clone() {
        Some(url) => match RedisStore::connect(&url).await {
            Ok(store) => ChatServer::new(server_config, Arc::new(store)),
            Err(e) => {
                error!(error = %e, "failed to connect to backing store");
                std::process::exit(1);
            }
        },
        None => {
            info!("no backing store configured, history and bus stay in process");
            ChatServer::new(server_config, Arc::new(MemoryStore::new()))
        }
    };
    let chat_server = match created {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    if let Err(e) = chat_server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("chat-relay stopped");
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
