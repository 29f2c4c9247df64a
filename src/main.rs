//! Eldor CLI - terminal client for the Eldor WhatsApp gateway
//!
//! Chat list and message sync over the gateway's REST API with a realtime
//! WebSocket feed and a polling fallback.

mod api;
mod auth;
mod commands;
mod config;
mod models;
mod realtime;
mod storage;
mod sync;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "eldor-cli")]
#[command(about = "Lightweight CLI client for the Eldor WhatsApp gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Keep reply cache and unread ledger in memory only
    #[arg(long, global = true)]
    ephemeral: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a gateway bearer token
    Login {
        /// JWT issued by the gateway
        token: String,
    },

    /// Clear the stored token
    Logout,

    /// Show current authentication status
    Status,

    /// List chats, unread first
    Chats {
        /// Only chats matching this text
        #[arg(short, long)]
        search: Option<String>,

        /// Maximum number of chats to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Read messages from a chat
    Read {
        /// Chat ID (from `chats` output)
        chat_id: String,

        /// Maximum number of messages to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Send a message
    Send {
        /// Chat ID, or temp:<phone> to start a new chat
        #[arg(short, long)]
        to: String,

        /// Message text
        message: String,

        /// Quote this message ID
        #[arg(long)]
        reply_to: Option<String>,
    },

    /// Send a file
    SendMedia {
        /// Chat ID
        #[arg(short, long)]
        to: String,

        /// File to send
        path: PathBuf,

        #[arg(short, long)]
        caption: Option<String>,

        /// MIME type (guessed from the extension if omitted)
        #[arg(long)]
        mime: Option<String>,
    },

    /// Start a chat with a phone number by sending the first message
    Start {
        /// Phone number, any formatting (e.g. +7 701 234 56 78)
        phone: String,

        /// First message
        message: String,
    },

    /// Delete a chat
    DeleteChat { chat_id: String },

    /// Delete a message
    DeleteMessage {
        chat_id: String,
        message_id: String,

        /// Also delete it for the other party
        #[arg(long)]
        remote: bool,
    },

    /// Upload a file and print its URL
    Upload {
        path: PathBuf,

        #[arg(long)]
        mime: Option<String>,
    },

    /// Print a realtime socket token
    WsToken,

    /// Follow chats live (realtime feed with polling fallback)
    Watch {
        /// Also follow messages of this chat
        #[arg(short, long)]
        chat: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let ephemeral = cli.ephemeral;
    match cli.command {
        Commands::Login { token } => {
            auth::login(&token).await?;
        }
        Commands::Logout => {
            auth::logout().await?;
        }
        Commands::Status => {
            auth::status().await?;
        }
        Commands::Chats { search, limit } => {
            tracing::info!("Fetching chats...");
            commands::list_chats(ephemeral, search.as_deref(), limit).await?;
        }
        Commands::Read { chat_id, limit } => {
            commands::read_messages(ephemeral, &chat_id, limit).await?;
        }
        Commands::Send {
            to,
            message,
            reply_to,
        } => {
            tracing::info!("Sending message...");
            commands::send_message(ephemeral, &to, &message, reply_to.as_deref()).await?;
        }
        Commands::SendMedia {
            to,
            path,
            caption,
            mime,
        } => {
            tracing::info!("Sending {}...", path.display());
            commands::send_media(ephemeral, &to, &path, caption.as_deref(), mime.as_deref())
                .await?;
        }
        Commands::Start { phone, message } => {
            commands::start_chat(ephemeral, &phone, &message).await?;
        }
        Commands::DeleteChat { chat_id } => {
            commands::delete_chat(ephemeral, &chat_id).await?;
        }
        Commands::DeleteMessage {
            chat_id,
            message_id,
            remote,
        } => {
            commands::delete_message(ephemeral, &chat_id, &message_id, remote).await?;
        }
        Commands::Upload { path, mime } => {
            commands::upload(&path, mime.as_deref()).await?;
        }
        Commands::WsToken => {
            commands::websocket_token().await?;
        }
        Commands::Watch { chat } => {
            commands::watch(ephemeral, chat.as_deref()).await?;
        }
    }

    Ok(())
}
