//! chat: terminal client for the chat relay.
//!
//! Joins as `--user`, prints everything the relay delivers, and sends each
//! line typed on stdin as a chat to `--to`. `/quit` leaves.

mod render;
mod session;

use clap::Parser;
use tracing::error;

/// chat: terminal chat client
#[derive(Parser)]
#[command(name = "chat", version, about = "Terminal client for the chat relay")]
struct Cli {
    /// Relay WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    url: String,

    /// User id to join as
    #[arg(short, long)]
    user: String,

    /// Receiver of outgoing chat (leave empty in room mode)
    #[arg(short, long, default_value = "")]
    to: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("chat=debug,chat_cli=debug,chat_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("chat=warn,chat_cli=warn")
            .with_target(false)
            .init();
    }

    if let Err(e) = session::run(&cli.url, &cli.user, &cli.to).await {
        error!("{:#}", e);
        eprintln!("chat: {e:#}");
        std::process::exit(1);
    }
}
