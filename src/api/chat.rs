//! Chat and message routes (`/api/chats/...`)

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::client::{json_body, GatewayClient};
use super::{ChatApi, MediaUpload, SendReceipt};
use crate::models::{normalize_phone, wire, Chat, Message};

/// Map every list item that parses, dropping (and logging) the rest.
fn map_items<T>(items: &[Value], what: &str, f: impl Fn(&Value) -> Option<T>) -> Vec<T> {
    let mapped: Vec<T> = items.iter().filter_map(&f).collect();
    if mapped.len() < items.len() {
        tracing::debug!(
            "Dropped {} unparseable {} entries",
            items.len() - mapped.len(),
            what
        );
    }
    mapped
}

fn media_form(upload: &MediaUpload) -> Result<reqwest::multipart::Form> {
    let part = reqwest::multipart::Part::bytes(upload.bytes.clone())
        .file_name(upload.file_name.clone())
        .mime_str(&upload.mime_type)
        .with_context(|| format!("Invalid MIME type: {}", upload.mime_type))?;
    Ok(reqwest::multipart::Form::new().part("file", part))
}

#[async_trait]
impl ChatApi for GatewayClient {
    async fn list_chats(&self, search: Option<&str>) -> Result<Vec<Chat>> {
        let mut url = self.url(&["chats"])?;
        if let Some(q) = search.filter(|q| !q.trim().is_empty()) {
            url.query_pairs_mut().append_pair("search", q.trim());
        }

        let body = json_body(self.get(url).await?).await?;
        let items = wire::extract_list(&body, &["chats", "data", "items"]);
        Ok(map_items(items, "chat", wire::chat_from_value))
    }

    async fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let url = self.url(&["chats", chat_id, "messages"])?;
        let body = json_body(self.get(url).await?).await?;
        let items = wire::extract_list(&body, &["messages", "data", "items"]);
        Ok(map_items(items, "message", |v| {
            wire::message_from_value(v, Some(chat_id))
        }))
    }

    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        quoted_id: Option<&str>,
    ) -> Result<SendReceipt> {
        let url = self.url(&["chats", chat_id, "send"])?;
        let mut body = json!({ "message": text });
        if let Some(q) = quoted_id {
            body["quoted_message_id"] = json!(q);
        }

        let resp = json_body(self.post_json(url, &body).await?).await?;
        Ok(SendReceipt {
            message_id: wire::sent_message_id(&resp),
        })
    }

    async fn send_media(
        &self,
        chat_id: &str,
        upload: &MediaUpload,
        quoted_id: Option<&str>,
    ) -> Result<SendReceipt> {
        let url = self.url(&["chats", chat_id, "send", "media"])?;
        let mut form = media_form(upload)?;
        if let Some(ref caption) = upload.caption {
            form = form.text("caption", caption.clone());
        }
        if let Some(q) = quoted_id {
            form = form.text("quoted_message_id", q.to_string());
        }

        let resp = json_body(self.post_multipart(url, form).await?).await?;
        Ok(SendReceipt {
            message_id: wire::sent_message_id(&resp),
        })
    }

    async fn start_chat(&self, phone: &str) -> Result<String> {
        let url = self.url(&["chats", "start"])?;
        let body = json!({ "phone": normalize_phone(phone) });
        let resp = json_body(self.post_json(url, &body).await?).await?;

        resp.get("chat_id")
            .or_else(|| resp.get("chatId"))
            .or_else(|| resp.get("data").and_then(|d| d.get("chat_id")))
            .and_then(Value::as_str)
            .map(String::from)
            .context("Start chat response has no chat_id")
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let url = self.url(&["chats", chat_id])?;
        self.delete(url).await?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: &str, message_id: &str, remote: bool) -> Result<()> {
        let mut url = self.url(&["chats", chat_id, "messages", message_id])?;
        url.query_pairs_mut()
            .append_pair("remote", if remote { "true" } else { "false" });
        self.delete(url).await?;
        Ok(())
    }

    async fn upload_file(&self, upload: &MediaUpload) -> Result<String> {
        self.upload(upload, media_form(upload)?).await
    }

    async fn websocket_token(&self) -> Result<String> {
        self.fetch_websocket_token().await
    }
}
