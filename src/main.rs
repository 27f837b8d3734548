mod client;
mod conversation;
mod protocol;
mod relay;
mod server;
mod ui;

use clap::{Parser, Subcommand};
use client::{ClientConfig, RelayClient};
use conversation::Conversation;
use protocol::RelayMode;
use server::RelayConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "chat-relay", about = "Chat relay endpoint and terminal client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the relay endpoint in front of the chat backend
    Relay {
        #[arg(long, env = "BACKEND_BASE_URL", default_value = "http://localhost:8000")]
        backend_url: String,
        #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:3000")]
        listen: String,
        #[arg(long, env = "RELAY_MODE", value_enum, default_value_t = RelayMode::Prompt)]
        mode: RelayMode,
        /// Give up on the backend after this many seconds (waits forever when unset)
        #[arg(long, env = "RELAY_BACKEND_TIMEOUT_SECS")]
        backend_timeout_secs: Option<u64>,
    },
    /// Chat through a running relay
    Chat {
        #[arg(long, env = "RELAY_URL", default_value = "http://127.0.0.1:3000/api/llm")]
        relay_url: String,
        #[arg(long, env = "RELAY_MODE", value_enum, default_value_t = RelayMode::Prompt)]
        mode: RelayMode,
        /// Session to join in session mode; a fresh one is generated when omitted
        #[arg(long)]
        session_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    match Cli::parse().command {
        Command::Relay {
            backend_url,
            listen,
            mode,
            backend_timeout_secs,
        } => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
                )
                .init();

            server::run(RelayConfig {
                listen,
                backend_url,
                mode,
                backend_timeout: backend_timeout_secs.map(Duration::from_secs),
            })
            .await
        }
        Command::Chat {
            relay_url,
            mode,
            session_id,
        } => {
            let session_id = match mode {
                RelayMode::Session => {
                    Some(session_id.unwrap_or_else(|| Uuid::new_v4().to_string()))
                }
                RelayMode::Prompt => None,
            };
            let client = RelayClient::new(ClientConfig { relay_url });
            let conversation = Arc::new(Conversation::new(client, session_id));

            ui::run_tui(conversation, mode)
        }
    }
}
