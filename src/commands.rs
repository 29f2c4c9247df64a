//! CLI commands. Each one builds what it needs from the config and prints
//! to stdout.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::api::{ChatApi, GatewayClient, MediaUpload};
use crate::config::Config;
use crate::models::{Author, Chat, DeliveryStatus, Message, ReplyRef};
use crate::realtime::{ApiTokenSource, ConnectionConfig, ConnectionManager};
use crate::storage::{FileStore, MemoryStore, SharedStore};
use crate::sync::{attach_realtime, ChatListSync, MessageListSync, SendOutcome};

/// Config, client and local store for one command run.
struct Session {
    config: Config,
    api: Arc<GatewayClient>,
    store: SharedStore,
}

impl Session {
    fn open(ephemeral: bool) -> Result<Self> {
        let config = Config::load().context("Failed to load config")?;
        let api = Arc::new(GatewayClient::new(&config)?);
        let store: SharedStore = if ephemeral {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(FileStore::open_default()?)
        };
        Ok(Self { config, api, store })
    }

    fn chats(&self) -> ChatListSync {
        ChatListSync::new(self.api.clone(), Arc::clone(&self.store), &self.config.sync)
    }

    fn messages(&self) -> MessageListSync {
        MessageListSync::new(self.api.clone(), Arc::clone(&self.store), &self.config.sync)
    }
}

fn format_time(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| ts.to_string())
}

fn print_chat(chat: &Chat) {
    let unread = if chat.has_unread() {
        format!(" ({} unread)", chat.unread)
    } else {
        String::new()
    };
    let group = if chat.is_group { " [group]" } else { "" };
    println!("{}{}{}", chat.name, group, unread);
    println!("  ID: {}", chat.id);
    if chat.time > 0 {
        println!("  Last: {}", format_time(chat.time));
    }
    if let Some(ref preview) = chat.last_message {
        if !preview.trim().is_empty() {
            println!("  {}", preview.trim());
        }
    }
}

fn print_message(msg: &Message) {
    let who = match msg.author {
        Author::Me => "me",
        Author::Them => msg.sender_name.as_deref().unwrap_or("them"),
    };
    let marker = if msg.pending {
        " (pending)"
    } else if msg.status == DeliveryStatus::Failed {
        " (failed)"
    } else {
        ""
    };
    if let Some(ref reply) = msg.reply_to {
        let quoted = match (&reply.media, reply.text.trim()) {
            (Some(media), "") => media.kind.label().to_string(),
            (_, text) if !text.is_empty() => text.to_string(),
            _ => reply.message_id.clone(),
        };
        println!("    > {}", quoted);
    }
    println!(
        "[{}] {}: {}{}",
        format_time(msg.timestamp),
        who,
        msg.preview(),
        marker
    );
    if let Some(ref media) = msg.media {
        println!("    {}", media.url);
    }
}

fn print_outcome(outcome: &SendOutcome) {
    if let Some(ref chat_id) = outcome.created_chat {
        println!("Chat created: {}", chat_id);
    }
    if outcome.message.pending {
        println!("Message sent (awaiting server id).");
    } else {
        println!("Message sent. ID: {}", outcome.message.id);
    }
}

/// Quote target for `--reply-to`: the loaded message if present, else a
/// bare reference by id.
fn reply_ref(messages: &MessageListSync, message_id: &str) -> ReplyRef {
    messages
        .messages()
        .iter()
        .find(|m| m.id == message_id || m.temp_id.as_deref() == Some(message_id))
        .map(ReplyRef::from_message)
        .unwrap_or_else(|| ReplyRef {
            message_id: message_id.to_string(),
            author: Author::Them,
            text: String::new(),
            media: None,
        })
}

/// List chats, unread first.
pub async fn list_chats(ephemeral: bool, search: Option<&str>, limit: usize) -> Result<()> {
    let session = Session::open(ephemeral)?;
    let chats = session.chats();
    match search {
        Some(query) => chats.search_chats(query).await?,
        None => chats.load_chats(false, None).await?,
    }

    println!("\nChats:");
    println!("{:-<60}", "");
    let list = chats.chats();
    if list.is_empty() {
        println!("  (no chats found)");
        return Ok(());
    }
    for chat in list.iter().take(limit) {
        print_chat(chat);
        println!();
    }
    Ok(())
}

/// Print the last `limit` messages of a chat and mark it read.
pub async fn read_messages(ephemeral: bool, chat_id: &str, limit: usize) -> Result<()> {
    let session = Session::open(ephemeral)?;
    let messages = session.messages();
    messages.load_messages(chat_id, false).await?;
    session.chats().mark_chat_as_read(chat_id);

    let list = messages.messages();
    if list.is_empty() {
        println!("(no messages)");
        return Ok(());
    }
    let skip = list.len().saturating_sub(limit);
    for msg in &list[skip..] {
        print_message(msg);
    }
    Ok(())
}

/// Send text to a chat or to a `temp:<phone>` placeholder.
pub async fn send_message(
    ephemeral: bool,
    to: &str,
    text: &str,
    reply_to: Option<&str>,
) -> Result<()> {
    let session = Session::open(ephemeral)?;
    let messages = session.messages();
    messages.load_messages(to, true).await?;
    let reply = reply_to.map(|id| reply_ref(&messages, id));

    let outcome = messages.send_message(text, reply).await?;
    print_outcome(&outcome);
    Ok(())
}

/// Send a file, optionally with a caption.
pub async fn send_media(
    ephemeral: bool,
    to: &str,
    path: &Path,
    caption: Option<&str>,
    mime: Option<&str>,
) -> Result<()> {
    let session = Session::open(ephemeral)?;
    let mut upload = MediaUpload::from_path(path, mime).await?;
    upload.caption = caption.map(String::from);

    let messages = session.messages();
    messages.load_messages(to, true).await?;
    let outcome = messages.send_media_message(&upload, None, None).await?;
    print_outcome(&outcome);
    Ok(())
}

/// Start a conversation with a phone number by sending the first message.
pub async fn start_chat(ephemeral: bool, phone: &str, text: &str) -> Result<()> {
    let session = Session::open(ephemeral)?;
    let chats = session.chats();
    let messages = session.messages();

    let temp_id = chats.create_chat(phone);
    messages.open_chat(&temp_id);
    let outcome = messages.send_message(text, None).await?;
    print_outcome(&outcome);
    Ok(())
}

pub async fn delete_chat(ephemeral: bool, chat_id: &str) -> Result<()> {
    let session = Session::open(ephemeral)?;
    session.chats().delete_chat(chat_id).await?;
    println!("Chat deleted.");
    Ok(())
}

pub async fn delete_message(
    ephemeral: bool,
    chat_id: &str,
    message_id: &str,
    remote: bool,
) -> Result<()> {
    let session = Session::open(ephemeral)?;
    let messages = session.messages();
    messages.load_messages(chat_id, true).await?;
    messages.delete_message(message_id, remote).await?;
    if remote {
        println!("Message deleted for everyone.");
    } else {
        println!("Message deleted.");
    }
    Ok(())
}

/// Upload a file and print its hosted URL.
pub async fn upload(path: &Path, mime: Option<&str>) -> Result<()> {
    let session = Session::open(true)?;
    let upload = MediaUpload::from_path(path, mime).await?;
    let url = session.api.upload_file(&upload).await?;
    println!("{}", url);
    Ok(())
}

/// Print a realtime socket token.
pub async fn websocket_token() -> Result<()> {
    let session = Session::open(true)?;
    println!("{}", session.api.websocket_token().await?);
    Ok(())
}

/// Follow the chat list (and optionally one chat) live until Ctrl+C.
///
/// Uses the realtime feed when enabled and the polling fallback otherwise.
pub async fn watch(ephemeral: bool, chat: Option<&str>) -> Result<()> {
    let session = Session::open(ephemeral)?;
    let chats = session.chats();
    let messages = session.messages();

    chats.load_chats(false, None).await?;
    for chat in chats.chats().iter().take(10) {
        print_chat(chat);
    }
    if let Some(chat_id) = chat {
        messages.load_messages(chat_id, false).await?;
        chats.set_active_chat(Some(chat_id));
        println!("\n-- {} --", chat_id);
        for msg in messages.messages() {
            print_message(&msg);
        }
    }

    let tokens = Arc::new(ApiTokenSource::new(session.api.clone(), session.api.token()));
    let conn = ConnectionManager::new(ConnectionConfig::from_config(&session.config), tokens);
    let handler = attach_realtime(&conn, &chats, &messages);
    conn.start();
    let _chat_poller = chats.spawn_poller(conn.subscribe_state());
    let _message_poller = messages.spawn_poller(conn.subscribe_state());

    let mut state_rx = conn.subscribe_state();
    let mut chat_rx = chats.changes();
    let mut msg_rx = messages.changes();

    let mut seen_chats: HashMap<String, (i64, u32)> = chats
        .chats()
        .into_iter()
        .map(|c| (c.id, (c.time, c.unread)))
        .collect();
    let mut seen_messages: HashMap<String, (DeliveryStatus, bool)> = messages
        .messages()
        .into_iter()
        .map(|m| (m.id, (m.status, m.pending)))
        .collect();

    println!("\nWatching for updates (Ctrl+C to quit)...");
    loop {
        tokio::select! {
            Ok(()) = state_rx.changed() => {
                let state = *state_rx.borrow_and_update();
                println!("-- connection {}", state.as_str());
            }
            Ok(()) = chat_rx.changed() => {
                chat_rx.borrow_and_update();
                for chat in chats.chats() {
                    let key = (chat.time, chat.unread);
                    if seen_chats.get(&chat.id) != Some(&key) {
                        print_chat(&chat);
                        seen_chats.insert(chat.id, key);
                    }
                }
            }
            Ok(()) = msg_rx.changed() => {
                msg_rx.borrow_and_update();
                for msg in messages.messages() {
                    let key = (msg.status, msg.pending);
                    if seen_messages.get(&msg.id) != Some(&key) {
                        print_message(&msg);
                        seen_messages.insert(msg.id, key);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    conn.off_message(handler);
    conn.shutdown().await;
    Ok(())
}
