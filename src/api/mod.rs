//! Gateway REST API
//!
//! `ChatApi` is the seam the synchronizers talk through; `GatewayClient`
//! implements it against the real gateway.

mod chat;
pub mod client;
mod files;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;

use crate::models::{Chat, MediaKind, Message};

pub use client::{ApiError, GatewayClient};

/// Result of a send call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Server message id, when the gateway echoes one.
    pub message_id: Option<String>,
}

/// A file to send or upload.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub caption: Option<String>,
}

impl MediaUpload {
    /// Read a file from disk. Without an explicit MIME type one is guessed
    /// from the extension.
    pub async fn from_path(path: &Path, mime: Option<&str>) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let mime_type = mime
            .map(String::from)
            .unwrap_or_else(|| guess_mime(&file_name).to_string());
        Ok(Self {
            file_name,
            mime_type,
            bytes,
            caption: None,
        })
    }

    pub fn kind(&self) -> MediaKind {
        MediaKind::from_mime(&self.mime_type)
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

fn guess_mime(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "3gp" => "video/3gpp",
        "mp3" => "audio/mpeg",
        "ogg" | "opus" => "audio/ogg",
        "m4a" => "audio/mp4",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Operations the synchronizers need from the gateway.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Full chat list, optionally filtered by a search string.
    async fn list_chats(&self, search: Option<&str>) -> Result<Vec<Chat>>;

    /// Messages of one chat, in whatever order the gateway returns them.
    async fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>>;

    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        quoted_id: Option<&str>,
    ) -> Result<SendReceipt>;

    async fn send_media(
        &self,
        chat_id: &str,
        upload: &MediaUpload,
        quoted_id: Option<&str>,
    ) -> Result<SendReceipt>;

    /// Create a chat for a phone number, returning the real chat id.
    async fn start_chat(&self, phone: &str) -> Result<String>;

    async fn delete_chat(&self, chat_id: &str) -> Result<()>;

    /// Delete a message; `remote` also deletes it for the other party.
    async fn delete_message(&self, chat_id: &str, message_id: &str, remote: bool) -> Result<()>;

    /// Upload a file, returning its hosted URL.
    async fn upload_file(&self, upload: &MediaUpload) -> Result<String>;

    /// Short-lived token for the realtime socket.
    async fn websocket_token(&self) -> Result<String>;
}
