//! Message list synchronizer
//!
//! Holds the messages of the open chat. Sends are optimistic: a pending
//! entry with a temporary id shows up at once and is reconciled with the
//! server copy by a delayed reload. Loads merge server data with local
//! pending/failed entries, collapse temporary/server id pairs and restore
//! quoted-message data from the reply cache.

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{ApiError, ChatApi, MediaUpload};
use crate::config::SyncSettings;
use crate::models::{
    is_temp_chat, temp_chat_phone, wire, DeliveryStatus, Media, Message, ReplyRef,
};
use crate::realtime::{ConnectionState, SyncEvent};
use crate::storage::SharedStore;

use super::reply_cache::{CachePolicy, ReplyCache};
use super::PollerHandle;

/// How far apart (seconds) a pending message and its server copy may be.
const MATCH_WINDOW_SECS: i64 = 120;

/// User-facing classification of a failed send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Number {phone} is not registered on WhatsApp")]
    NotRegistered { phone: String },

    #[error("Authorization failed -- run 'eldor-cli login'")]
    Unauthorized,

    #[error("Gateway server error, try again later")]
    Server,

    #[error("No chat is open")]
    NoChat,

    #[error("{0}")]
    Other(String),
}

impl SendError {
    /// Classify by HTTP status: the typed status when the error carries one,
    /// else status codes found in the rendered error chain. `phone` is the
    /// number being started, if any; 404/422 only mean "not registered"
    /// when there is one.
    pub fn classify(err: &anyhow::Error, phone: Option<&str>) -> Self {
        let status = err
            .chain()
            .find_map(|e| e.downcast_ref::<ApiError>())
            .map(ApiError::status);
        let rendered = format!("{:#}", err);
        let has = |code: u16| match status {
            Some(s) => s == code,
            None => mentions_status(&rendered, code),
        };

        if has(422) || has(404) {
            if let Some(phone) = phone {
                return SendError::NotRegistered {
                    phone: phone.to_string(),
                };
            }
        }
        if has(401) {
            return SendError::Unauthorized;
        }
        if has(500) || status.is_some_and(|s| s >= 500) {
            return SendError::Server;
        }
        SendError::Other(rendered)
    }
}

/// Whether `text` contains `code` as a standalone number (`HTTP 500`, not
/// `:5000` or `15003`).
fn mentions_status(text: &str, code: u16) -> bool {
    let code = code.to_string();
    let bytes = text.as_bytes();
    text.match_indices(&code).any(|(at, _)| {
        let before = at.checked_sub(1).map(|i| bytes[i]);
        let after = bytes.get(at + code.len()).copied();
        !before.is_some_and(|b| b.is_ascii_digit()) && !after.is_some_and(|b| b.is_ascii_digit())
    })
}

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// Real chat id, when the send created the chat from a `temp:` placeholder.
    pub created_chat: Option<String>,
}

/// Collapse entries sharing an id after sorting by creation time.
///
/// An entry is matched by its resolved id or by its temporary id, so a
/// pending copy and its confirmed copy end up as one entry; the confirmed
/// one wins.
pub fn dedup_messages(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by_key(|m| m.timestamp);

    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for msg in messages {
        let existing = std::iter::once(msg.id.as_str())
            .chain(msg.temp_id.as_deref())
            .find_map(|k| index.get(k).copied());

        let slot = match existing {
            Some(i) => {
                let mut dropped = msg;
                if out[i].is_unconfirmed() && !dropped.is_unconfirmed() {
                    std::mem::swap(&mut out[i], &mut dropped);
                }
                if out[i].reply_to.is_none() {
                    out[i].reply_to = dropped.reply_to;
                }
                i
            }
            None => {
                out.push(msg);
                out.len() - 1
            }
        };

        index.insert(out[slot].id.clone(), slot);
        if let Some(temp) = out[slot].temp_id.clone() {
            index.insert(temp, slot);
        }
    }
    out
}

/// Whether `server` is the gateway's copy of the pending `local` send.
fn is_echo_of(server: &Message, local: &Message) -> bool {
    server.is_outgoing()
        && server.text.trim() == local.text.trim()
        && server.media.is_some() == local.media.is_some()
        && (server.timestamp - local.timestamp).abs() <= MATCH_WINDOW_SECS
}

/// Merge a fresh server list with what is shown locally.
///
/// Server entries are authoritative. Local sends (entries with a temporary
/// id) are matched to their server copy by id once confirmed, or by the echo
/// heuristic while pending; matched copies inherit the temporary id and the
/// quoted data. Unmatched local sends stay: they are still in flight, have
/// failed, or the gateway has not listed them yet.
pub fn merge_server_messages(local: &[Message], mut server: Vec<Message>) -> Vec<Message> {
    let server_ids: HashSet<String> = local
        .iter()
        .filter(|m| !m.is_unconfirmed())
        .map(|m| m.id.clone())
        .collect();
    let mut claimed = vec![false; server.len()];
    let mut kept = Vec::new();

    for mine in local {
        let Some(temp_id) = mine.temp_id.as_deref() else {
            continue;
        };
        let found = if !mine.is_unconfirmed() {
            server.iter().position(|m| m.id == mine.id)
        } else if mine.status == DeliveryStatus::Failed {
            None
        } else {
            (0..server.len()).find(|&i| {
                !claimed[i] && !server_ids.contains(&server[i].id) && is_echo_of(&server[i], mine)
            })
        };

        match found {
            Some(i) => {
                claimed[i] = true;
                let copy = &mut server[i];
                if copy.temp_id.is_none() {
                    copy.temp_id = Some(temp_id.to_string());
                }
                if copy.reply_to.is_none() {
                    copy.reply_to = mine.reply_to.clone();
                }
            }
            None => kept.push(mine.clone()),
        }
    }

    server.extend(kept);
    server
}

/// Fill missing quoted data from the cache, by temporary id then server id.
fn enrich_replies(messages: &mut [Message], cache: Option<&ReplyCache>) {
    let Some(cache) = cache else {
        return;
    };
    for msg in messages.iter_mut().filter(|m| m.reply_to.is_none()) {
        msg.reply_to = msg
            .temp_id
            .as_deref()
            .and_then(|t| cache.get_reply(t))
            .or_else(|| cache.get_reply(&msg.id));
    }
}

/// Fold a status/content update into an existing entry.
fn merge_update(existing: &mut Message, update: &Message) {
    existing.status = update.status;
    existing.pending = false;
    if !update.text.is_empty() {
        existing.text = update.text.clone();
    }
    if update.media.is_some() {
        existing.media = update.media.clone();
    }
    if update.reply_to.is_some() {
        existing.reply_to = update.reply_to.clone();
    }
}

enum Outgoing<'a> {
    Text(&'a str),
    Media(&'a MediaUpload),
}

#[derive(Default)]
struct MessageState {
    chat_id: Option<String>,
    messages: Vec<Message>,
    loading: bool,
    error: Option<String>,
    /// Bumped on every chat switch; loads started under an older value are
    /// discarded.
    generation: u64,
    /// Set once a load of the open chat completed; polling waits for it.
    loaded: bool,
    replies: Option<ReplyCache>,
}

struct Inner {
    api: Arc<dyn ChatApi>,
    store: SharedStore,
    policy: CachePolicy,
    reload_delay: Duration,
    realtime: bool,
    poll_interval: Duration,
    visible: AtomicBool,
    state: Mutex<MessageState>,
    changes: watch::Sender<u64>,
    reload: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the open chat's message list.
#[derive(Clone)]
pub struct MessageListSync {
    inner: Arc<Inner>,
}

impl MessageListSync {
    pub fn new(api: Arc<dyn ChatApi>, store: SharedStore, settings: &SyncSettings) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                policy: CachePolicy::from_settings(settings),
                reload_delay: settings.reload_delay(),
                realtime: settings.realtime,
                poll_interval: settings.poll_interval(),
                visible: AtomicBool::new(true),
                state: Mutex::new(MessageState::default()),
                changes,
                reload: Mutex::new(None),
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MessageState) -> R) -> R {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|rev| *rev += 1);
    }

    /// Revision counter bumped on every visible change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.with_state(|s| s.messages.clone())
    }

    pub fn active_chat(&self) -> Option<String> {
        self.with_state(|s| s.chat_id.clone())
    }

    pub fn loading(&self) -> bool {
        self.with_state(|s| s.loading)
    }

    pub fn error(&self) -> Option<String> {
        self.with_state(|s| s.error.clone())
    }

    /// Switch to `chat_id` with an empty list. No-op if already open.
    pub fn open_chat(&self, chat_id: &str) {
        if self.active_chat().as_deref() == Some(chat_id) {
            return;
        }
        let replies = (!is_temp_chat(chat_id)).then(|| {
            ReplyCache::load(Arc::clone(&self.inner.store), chat_id, self.inner.policy)
        });
        self.cancel_reload();
        self.with_state(|s| {
            s.chat_id = Some(chat_id.to_string());
            s.messages.clear();
            s.loading = false;
            s.error = None;
            s.generation += 1;
            s.loaded = false;
            s.replies = replies;
        });
        tracing::debug!("Opened chat {}", chat_id);
        self.notify();
    }

    pub fn close_chat(&self) {
        self.cancel_reload();
        self.with_state(|s| {
            *s = MessageState {
                generation: s.generation + 1,
                ..Default::default()
            };
        });
        self.notify();
    }

    /// Fetch the messages of `chat_id`, opening it first if needed.
    ///
    /// If another chat was opened while the request was in flight the
    /// response is dropped.
    pub async fn load_messages(&self, chat_id: &str, silent: bool) -> Result<()> {
        self.open_chat(chat_id);
        if is_temp_chat(chat_id) {
            return Ok(());
        }

        let generation = self.with_state(|s| {
            if !silent {
                s.loading = true;
            }
            s.generation
        });
        if !silent {
            self.notify();
        }

        let result = self.inner.api.get_messages(chat_id).await;

        let applied = self.with_state(|s| {
            if s.generation != generation || s.chat_id.as_deref() != Some(chat_id) {
                return None;
            }
            s.loading = false;
            Some(match result {
                Ok(server) => {
                    let merged = merge_server_messages(&s.messages, server);
                    let mut messages = dedup_messages(merged);
                    enrich_replies(&mut messages, s.replies.as_ref());
                    s.messages = messages;
                    s.error = None;
                    s.loaded = true;
                    Ok(())
                }
                Err(e) => {
                    s.error = Some(format!("{:#}", e));
                    Err(e)
                }
            })
        });

        match applied {
            None => {
                tracing::debug!("Dropping stale message list for {}", chat_id);
                Ok(())
            }
            Some(result) => {
                self.notify();
                result.with_context(|| format!("Failed to load messages for {}", chat_id))
            }
        }
    }

    /// Polling only runs while visible.
    pub fn set_visible(&self, visible: bool) {
        self.inner.visible.store(visible, Ordering::Relaxed);
    }

    /// Whether the poller should refetch the open chat given the connection
    /// state.
    pub fn should_poll(&self, state: ConnectionState) -> bool {
        let realtime_up = self.inner.realtime && state == ConnectionState::Connected;
        self.inner.visible.load(Ordering::Relaxed)
            && self.with_state(|s| s.loaded && s.chat_id.is_some())
            && !realtime_up
    }

    /// Reload the open chat every `poll_interval` while `should_poll` holds.
    pub fn spawn_poller(&self, state: watch::Receiver<ConnectionState>) -> PollerHandle {
        let sync = self.clone();
        let period = self.inner.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let current = *state.borrow();
                if !sync.should_poll(current) {
                    continue;
                }
                let Some(chat_id) = sync.active_chat() else {
                    continue;
                };
                tracing::debug!(
                    "Polling messages of {} (connection {})",
                    chat_id,
                    current.as_str()
                );
                if let Err(e) = sync.load_messages(&chat_id, true).await {
                    tracing::debug!("Message poll failed: {:#}", e);
                }
            }
        });
        PollerHandle { task }
    }

    /// Send text to the open chat.
    pub async fn send_message(
        &self,
        text: &str,
        reply_to: Option<ReplyRef>,
    ) -> Result<SendOutcome, SendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendError::Other("Message text is empty".into()));
        }
        let chat_id = self.active_chat().ok_or(SendError::NoChat)?;
        let mut message = Message::optimistic(&chat_id, text, wire::now_secs());
        message.reply_to = reply_to;
        self.deliver(message, Outgoing::Text(text)).await
    }

    /// Send a file to the open chat. `media_url` is shown on the pending
    /// entry (e.g. an already uploaded copy); the file name is used otherwise.
    pub async fn send_media_message(
        &self,
        upload: &MediaUpload,
        media_url: Option<&str>,
        reply_to: Option<ReplyRef>,
    ) -> Result<SendOutcome, SendError> {
        let chat_id = self.active_chat().ok_or(SendError::NoChat)?;
        let caption = upload.caption.as_deref().unwrap_or_default().trim();
        let mut message = Message::optimistic(&chat_id, caption, wire::now_secs());
        message.media = Some(Media {
            url: media_url.unwrap_or(upload.file_name.as_str()).to_string(),
            mime_type: Some(upload.mime_type.clone()),
            size: Some(upload.size()),
            kind: upload.kind(),
        });
        message.reply_to = reply_to;
        self.deliver(message, Outgoing::Media(upload)).await
    }

    /// Replace a failed text message with a fresh send.
    pub async fn retry_message(&self, message_id: &str) -> Result<SendOutcome, SendError> {
        let failed = self.with_state(|s| {
            let i = s
                .messages
                .iter()
                .position(|m| m.id == message_id && m.status == DeliveryStatus::Failed)?;
            if s.messages[i].media.is_some() {
                return Some(Err(()));
            }
            Some(Ok(s.messages.remove(i)))
        });
        let failed = match failed {
            None => return Err(SendError::Other(format!("No failed message {}", message_id))),
            Some(Err(())) => {
                return Err(SendError::Other(
                    "Media messages cannot be retried; send the file again".into(),
                ))
            }
            Some(Ok(m)) => m,
        };
        self.notify();

        let mut message = Message::optimistic(&failed.chat_id, &failed.text, wire::now_secs());
        message.reply_to = failed.reply_to.clone();
        self.deliver(message, Outgoing::Text(&failed.text)).await
    }

    /// Delete a message. Entries the server never confirmed are removed
    /// locally only.
    pub async fn delete_message(&self, message_id: &str, remote: bool) -> Result<()> {
        let (chat_id, local_only) = self.with_state(|s| {
            let local_only = s
                .messages
                .iter()
                .find(|m| m.id == message_id)
                .map(Message::is_unconfirmed);
            (s.chat_id.clone(), local_only)
        });
        let chat_id = chat_id.context("No chat is open")?;
        match local_only {
            None => bail!("Message {} not found in {}", message_id, chat_id),
            Some(true) => {}
            Some(false) => {
                self.inner
                    .api
                    .delete_message(&chat_id, message_id, remote)
                    .await?
            }
        }
        self.with_state(|s| s.messages.retain(|m| m.id != message_id));
        self.notify();
        Ok(())
    }

    /// Merge one realtime event. Events for other chats are ignored.
    pub fn handle_event(&self, event: &SyncEvent) {
        let changed = self.with_state(|s| {
            let active = s.chat_id.clone();
            let is_active = |chat_id: &str| active.as_deref() == Some(chat_id);
            match event {
                SyncEvent::NewMessage { chat_id, message } if is_active(chat_id) => {
                    apply_incoming(s, message);
                    true
                }
                SyncEvent::MessageUpdated { chat_id, message } if is_active(chat_id) => {
                    let found = s.messages.iter_mut().find(|m| {
                        m.id == message.id || m.temp_id.as_deref() == Some(message.id.as_str())
                    });
                    match found {
                        Some(existing) => {
                            merge_update(existing, message);
                            true
                        }
                        None => false,
                    }
                }
                SyncEvent::MessageDeleted {
                    chat_id,
                    message_id,
                } if is_active(chat_id) => {
                    let before = s.messages.len();
                    s.messages.retain(|m| {
                        m.id != *message_id && m.temp_id.as_deref() != Some(message_id.as_str())
                    });
                    s.messages.len() != before
                }
                SyncEvent::ChatDeleted { chat_id } if is_active(chat_id) => {
                    s.messages.clear();
                    true
                }
                _ => false,
            }
        });
        if changed {
            self.notify();
        }
    }

    /// Optimistic send protocol shared by text, media and retry.
    async fn deliver(
        &self,
        mut message: Message,
        outgoing: Outgoing<'_>,
    ) -> Result<SendOutcome, SendError> {
        let temp_id = message.id.clone();
        let mut chat_id = message.chat_id.clone();

        if let Some(reply) = &message.reply_to {
            self.cache_reply_for(&chat_id, &temp_id, reply);
        }
        self.with_state(|s| {
            if s.chat_id.as_deref() == Some(chat_id.as_str()) {
                s.messages.push(message.clone());
            }
        });
        self.notify();

        let mut created_chat = None;
        if let Some(phone) = temp_chat_phone(&chat_id).map(String::from) {
            match self.inner.api.start_chat(&phone).await {
                Ok(real_id) => {
                    tracing::info!("Created chat {} for {}", real_id, phone);
                    self.promote_chat(&chat_id, &real_id);
                    if let Some(reply) = &message.reply_to {
                        self.cache_reply_for(&real_id, &temp_id, reply);
                    }
                    chat_id = real_id.clone();
                    message.chat_id = real_id.clone();
                    created_chat = Some(real_id);
                }
                Err(e) => {
                    tracing::warn!("Failed to start chat with {}: {:#}", phone, e);
                    self.with_state(|s| s.messages.retain(|m| m.id != temp_id));
                    self.notify();
                    return Err(SendError::classify(&e, Some(&phone)));
                }
            }
        }

        let quoted = message.reply_to.as_ref().map(|r| r.message_id.clone());
        let result = match outgoing {
            Outgoing::Text(text) => {
                self.inner
                    .api
                    .send_text(&chat_id, text, quoted.as_deref())
                    .await
            }
            Outgoing::Media(upload) => {
                self.inner
                    .api
                    .send_media(&chat_id, upload, quoted.as_deref())
                    .await
            }
        };

        match result {
            Ok(receipt) => {
                if let Some(server_id) = receipt.message_id.as_deref() {
                    message.confirm(server_id);
                    if let Some(reply) = &message.reply_to {
                        self.cache_reply_for(&chat_id, server_id, reply);
                    }
                }
                let confirmed = message.clone();
                self.update_local(&temp_id, move |m| {
                    m.chat_id = confirmed.chat_id;
                    m.id = confirmed.id;
                    m.pending = confirmed.pending;
                });
                self.schedule_reload(&chat_id);
                Ok(SendOutcome {
                    message,
                    created_chat,
                })
            }
            Err(e) => {
                tracing::warn!("Send to {} failed: {:#}", chat_id, e);
                message.mark_failed();
                self.update_local(&temp_id, Message::mark_failed);
                Err(SendError::classify(&e, None))
            }
        }
    }

    /// Apply `f` to the local entry created with `temp_id`, if still shown.
    fn update_local<F: FnOnce(&mut Message)>(&self, temp_id: &str, f: F) {
        let found = self.with_state(|s| {
            s.messages
                .iter_mut()
                .find(|m| m.temp_id.as_deref() == Some(temp_id))
                .map(f)
                .is_some()
        });
        if found {
            self.notify();
        }
    }

    /// Move the open placeholder chat over to its real id.
    fn promote_chat(&self, temp_chat: &str, real_id: &str) {
        let replies = ReplyCache::load(Arc::clone(&self.inner.store), real_id, self.inner.policy);
        self.with_state(|s| {
            if s.chat_id.as_deref() != Some(temp_chat) {
                return;
            }
            s.chat_id = Some(real_id.to_string());
            s.replies = Some(replies);
            for m in s.messages.iter_mut() {
                m.chat_id = real_id.to_string();
            }
        });
        self.notify();
    }

    fn cache_reply_for(&self, chat_id: &str, message_id: &str, reply: &ReplyRef) {
        if is_temp_chat(chat_id) {
            return;
        }
        let cached = self.with_state(|s| match s.replies.as_mut() {
            Some(cache) if cache.chat_id() == chat_id => {
                cache.cache_reply(message_id, reply);
                true
            }
            _ => false,
        });
        if !cached {
            ReplyCache::load(Arc::clone(&self.inner.store), chat_id, self.inner.policy)
                .cache_reply(message_id, reply);
        }
    }

    /// Reload `chat_id` after the configured delay to pick up server ids.
    /// A newer schedule replaces a pending one.
    fn schedule_reload(&self, chat_id: &str) {
        let sync = self.clone();
        let chat_id = chat_id.to_string();
        let delay = self.inner.reload_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sync.active_chat().as_deref() != Some(chat_id.as_str()) {
                return;
            }
            if let Err(e) = sync.load_messages(&chat_id, true).await {
                tracing::debug!("Reload after send failed: {:#}", e);
            }
        });
        let previous = self
            .inner
            .reload
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel_reload(&self) {
        let pending = self
            .inner
            .reload
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = pending {
            task.abort();
        }
    }
}

/// Add a realtime message to the open list. A known id is updated in place;
/// our own echo confirms the matching pending entry.
fn apply_incoming(s: &mut MessageState, message: &Message) {
    if let Some(i) = s.messages.iter().position(|m| m.id == message.id) {
        merge_update(&mut s.messages[i], message);
        return;
    }

    let pending = s.messages.iter().position(|m| {
        m.is_unconfirmed() && m.status != DeliveryStatus::Failed && is_echo_of(message, m)
    });
    if let Some(i) = pending {
        let entry = &mut s.messages[i];
        entry.confirm(&message.id);
        entry.status = message.status;
        return;
    }

    let mut incoming = message.clone();
    enrich_replies(std::slice::from_mut(&mut incoming), s.replies.as_ref());
    let mut messages = std::mem::take(&mut s.messages);
    messages.push(incoming);
    s.messages = dedup_messages(messages);
}
