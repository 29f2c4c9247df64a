//! Scripted in-memory gateway for synchronizer tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use crate::api::{ApiError, ChatApi, MediaUpload, SendReceipt};
use crate::models::{wire, Author, Chat, DeliveryStatus, Message};

#[derive(Default)]
pub struct FakeApi {
    pub chats: Mutex<Vec<Chat>>,
    pub messages: Mutex<HashMap<String, Vec<Message>>>,
    /// Per-chat delay before `get_messages` answers.
    pub delays: Mutex<HashMap<String, Duration>>,
    /// Every send fails like a dropped connection.
    pub offline: AtomicBool,
    /// Send responses omit the server id.
    pub hide_receipt_ids: AtomicBool,
    /// HTTP status `start_chat` fails with, if any.
    pub start_chat_status: Mutex<Option<u16>>,
    /// When set, `start_chat` waits for `gate` before answering.
    pub gated: AtomicBool,
    pub gate: Notify,
    pub list_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub deleted_chats: Mutex<Vec<String>>,
    pub deleted_messages: Mutex<Vec<(String, String, bool)>>,
    next_id: AtomicU64,
}

impl FakeApi {
    pub fn with_chats(chats: Vec<Chat>) -> Self {
        let api = Self::default();
        *api.chats.lock().unwrap() = chats;
        api
    }

    pub fn set_messages(&self, chat_id: &str, messages: Vec<Message>) {
        self.messages
            .lock()
            .unwrap()
            .insert(chat_id.to_string(), messages);
    }

    pub fn stored(&self, chat_id: &str) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap()
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    fn store_sent(&self, chat_id: &str, text: &str) -> String {
        let id = format!("SRV{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let msg = Message {
            id: id.clone(),
            temp_id: None,
            chat_id: chat_id.to_string(),
            author: Author::Me,
            text: text.to_string(),
            media: None,
            reply_to: None,
            status: DeliveryStatus::Sent,
            pending: false,
            timestamp: wire::now_secs(),
            sender_name: None,
        };
        self.messages
            .lock()
            .unwrap()
            .entry(chat_id.to_string())
            .or_default()
            .push(msg);
        id
    }

    fn receipt(&self, id: String) -> SendReceipt {
        SendReceipt {
            message_id: (!self.hide_receipt_ids.load(Ordering::SeqCst)).then_some(id),
        }
    }
}

pub fn chat(id: &str, unread: u32, time: i64) -> Chat {
    let mut c = Chat::synthesize(id, None, time);
    c.unread = unread;
    c
}

pub fn inbound(id: &str, chat_id: &str, text: &str, timestamp: i64) -> Message {
    Message {
        id: id.to_string(),
        temp_id: None,
        chat_id: chat_id.to_string(),
        author: Author::Them,
        text: text.to_string(),
        media: None,
        reply_to: None,
        status: DeliveryStatus::Delivered,
        pending: false,
        timestamp,
        sender_name: None,
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_chats(&self, search: Option<&str>) -> Result<Vec<Chat>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let chats = self.chats.lock().unwrap().clone();
        Ok(match search {
            Some(q) => chats.into_iter().filter(|c| c.name.contains(q)).collect(),
            None => chats,
        })
    }

    async fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(chat_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.stored(chat_id))
    }

    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        _quoted_id: Option<&str>,
    ) -> Result<SendReceipt> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("error sending request: connection refused"));
        }
        let id = self.store_sent(chat_id, text);
        Ok(self.receipt(id))
    }

    async fn send_media(
        &self,
        chat_id: &str,
        upload: &MediaUpload,
        _quoted_id: Option<&str>,
    ) -> Result<SendReceipt> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("error sending request: connection refused"));
        }
        let id = self.store_sent(chat_id, upload.caption.as_deref().unwrap_or_default());
        Ok(self.receipt(id))
    }

    async fn start_chat(&self, phone: &str) -> Result<String> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        let status = *self.start_chat_status.lock().unwrap();
        match status {
            Some(status) => Err(ApiError::Status {
                status,
                url: "http://fake/api/chats/start".into(),
                body: format!("{{\"error\":\"{} not on WhatsApp\"}}", phone),
            }
            .into()),
            None => Ok(format!("{}@c.us", phone)),
        }
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        self.deleted_chats.lock().unwrap().push(chat_id.to_string());
        self.chats.lock().unwrap().retain(|c| c.id != chat_id);
        Ok(())
    }

    async fn delete_message(&self, chat_id: &str, message_id: &str, remote: bool) -> Result<()> {
        self.deleted_messages.lock().unwrap().push((
            chat_id.to_string(),
            message_id.to_string(),
            remote,
        ));
        if let Some(list) = self.messages.lock().unwrap().get_mut(chat_id) {
            list.retain(|m| m.id != message_id);
        }
        Ok(())
    }

    async fn upload_file(&self, upload: &MediaUpload) -> Result<String> {
        Ok(format!("https://cdn.fake/{}", upload.file_name))
    }

    async fn websocket_token(&self) -> Result<String> {
        Ok("ws-token".into())
    }
}
