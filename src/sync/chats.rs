//! Chat list synchronizer
//!
//! Keeps the ordered chat list, merges realtime events into it and polls the
//! gateway while push delivery is unavailable. Ordering is always unread
//! first, then most recent first.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::api::ChatApi;
use crate::config::SyncSettings;
use crate::models::{is_temp_chat, temp_chat_id, wire, Chat, Message};
use crate::realtime::{ConnectionState, SyncEvent};
use crate::storage::SharedStore;

use super::unread::UnreadLedger;
use super::PollerHandle;

/// Stable sort: chats with unread messages first, then by time descending.
pub fn sort_chats(chats: &mut [Chat]) {
    chats.sort_by(|a, b| {
        b.has_unread()
            .cmp(&a.has_unread())
            .then_with(|| b.time.cmp(&a.time))
    });
}

/// The in-memory list. Ids are unique and the order is kept sorted after
/// every mutation.
#[derive(Debug, Clone, Default)]
pub struct ChatList {
    chats: Vec<Chat>,
}

impl ChatList {
    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }

    pub fn get(&self, chat_id: &str) -> Option<&Chat> {
        self.chats.iter().find(|c| c.id == chat_id)
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    /// Replace the list with a fresh fetch. Later duplicates of an id are dropped.
    pub fn replace_all(&mut self, chats: Vec<Chat>) {
        let mut seen = std::collections::HashSet::new();
        self.chats = chats
            .into_iter()
            .filter(|c| seen.insert(c.id.clone()))
            .collect();
        sort_chats(&mut self.chats);
    }

    /// Insert or replace by id.
    pub fn upsert(&mut self, chat: Chat) {
        match self.chats.iter_mut().find(|c| c.id == chat.id) {
            Some(existing) => *existing = chat,
            None => self.chats.insert(0, chat),
        }
        sort_chats(&mut self.chats);
    }

    /// Apply `f` to one chat. Returns false if the id is unknown.
    pub fn update<F: FnOnce(&mut Chat)>(&mut self, chat_id: &str, f: F) -> bool {
        let Some(chat) = self.chats.iter_mut().find(|c| c.id == chat_id) else {
            return false;
        };
        f(chat);
        sort_chats(&mut self.chats);
        true
    }

    /// Fold a new message into the list.
    ///
    /// A known chat gets the preview, time and (for inbound messages outside
    /// the active chat) an unread bump, then moves to the front of its group.
    /// An inbound message for an unknown chat creates the chat. Returns true
    /// when the unread counter was bumped.
    pub fn apply_message(&mut self, message: &Message, active: bool) -> bool {
        let bump = !message.is_outgoing() && !active;
        let position = self.chats.iter().position(|c| c.id == message.chat_id);

        let mut chat = match position {
            Some(i) => self.chats.remove(i),
            None if message.is_outgoing() => return false,
            None => Chat::synthesize(
                &message.chat_id,
                message.sender_name.as_deref(),
                message.timestamp,
            ),
        };

        chat.last_message = Some(message.preview());
        chat.time = chat.time.max(message.timestamp);
        if bump {
            chat.unread = chat.unread.saturating_add(1);
        }
        self.chats.insert(0, chat);
        sort_chats(&mut self.chats);
        bump
    }

    pub fn remove(&mut self, chat_id: &str) -> bool {
        let before = self.chats.len();
        self.chats.retain(|c| c.id != chat_id);
        self.chats.len() != before
    }

    /// Zero the unread counter of one chat.
    pub fn mark_read(&mut self, chat_id: &str) -> bool {
        self.update(chat_id, |c| c.unread = 0)
    }
}

#[derive(Debug, Default)]
struct ChatListState {
    list: ChatList,
    loading: bool,
    error: Option<String>,
    /// Set once the first load completed; polling waits for it.
    loaded: bool,
    search: Option<String>,
    active: Option<String>,
    visible: bool,
}

struct Inner {
    api: Arc<dyn ChatApi>,
    state: Mutex<ChatListState>,
    ledger: Mutex<UnreadLedger>,
    changes: watch::Sender<u64>,
    realtime: bool,
    poll_interval: Duration,
}

/// Shared handle to the chat list. Clones observe the same list.
#[derive(Clone)]
pub struct ChatListSync {
    inner: Arc<Inner>,
}

impl ChatListSync {
    pub fn new(api: Arc<dyn ChatApi>, store: SharedStore, settings: &SyncSettings) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                api,
                state: Mutex::new(ChatListState {
                    visible: true,
                    ..Default::default()
                }),
                ledger: Mutex::new(UnreadLedger::load(store, settings.unread_ledger_max_entries)),
                changes,
                realtime: settings.realtime,
                poll_interval: settings.poll_interval(),
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ChatListState) -> R) -> R {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn with_ledger<R>(&self, f: impl FnOnce(&mut UnreadLedger) -> R) -> R {
        let mut ledger = self.inner.ledger.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut ledger)
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|rev| *rev += 1);
    }

    /// Revision counter bumped on every visible change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn chats(&self) -> Vec<Chat> {
        self.with_state(|s| s.list.chats().to_vec())
    }

    pub fn get(&self, chat_id: &str) -> Option<Chat> {
        self.with_state(|s| s.list.get(chat_id).cloned())
    }

    pub fn loading(&self) -> bool {
        self.with_state(|s| s.loading)
    }

    pub fn error(&self) -> Option<String> {
        self.with_state(|s| s.error.clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.with_state(|s| s.loaded)
    }

    /// Filter of the last load, reused by background refreshes.
    pub fn search_query(&self) -> Option<String> {
        self.with_state(|s| s.search.clone())
    }

    /// Fetch the list. A silent load skips the loading flag (used by
    /// polling). On failure the current list is kept and the error recorded.
    pub async fn load_chats(&self, silent: bool, search: Option<&str>) -> Result<()> {
        let search = search.map(str::trim).filter(|q| !q.is_empty()).map(String::from);
        self.with_state(|s| {
            s.search = search.clone();
            if !silent {
                s.loading = true;
            }
        });
        if !silent {
            self.notify();
        }

        let result = self.inner.api.list_chats(search.as_deref()).await;
        match result {
            Ok(mut chats) => {
                self.with_ledger(|ledger| chats.iter_mut().for_each(|c| ledger.reconcile(c)));
                tracing::debug!("Loaded {} chats", chats.len());
                self.with_state(|s| {
                    s.list.replace_all(chats);
                    s.loading = false;
                    s.loaded = true;
                    s.error = None;
                });
                self.notify();
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to load chats: {:#}", e);
                self.with_state(|s| {
                    s.loading = false;
                    s.error = Some(format!("{:#}", e));
                });
                self.notify();
                Err(e)
            }
        }
    }

    /// Reload filtered by `query`. An empty query clears the filter.
    pub async fn search_chats(&self, query: &str) -> Result<()> {
        self.load_chats(false, Some(query)).await
    }

    /// Mutate one chat in place. Returns false if the id is unknown.
    pub fn update_chat<F: FnOnce(&mut Chat)>(&self, chat_id: &str, f: F) -> bool {
        let changed = self.with_state(|s| s.list.update(chat_id, f));
        if changed {
            self.notify();
        }
        changed
    }

    pub fn add_chat(&self, chat: Chat) {
        self.with_state(|s| s.list.upsert(chat));
        self.notify();
    }

    /// Placeholder id for a conversation that does not exist upstream yet.
    /// Nothing is sent and the list is left alone; the chat is created on
    /// the first send.
    pub fn create_chat(&self, phone: &str) -> String {
        temp_chat_id(phone)
    }

    /// Delete upstream (unless the chat is a local placeholder), then drop it
    /// from the list.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        if !is_temp_chat(chat_id) {
            self.inner.api.delete_chat(chat_id).await?;
        }
        self.forget(chat_id);
        Ok(())
    }

    fn forget(&self, chat_id: &str) {
        let removed = self.with_state(|s| {
            if s.active.as_deref() == Some(chat_id) {
                s.active = None;
            }
            s.list.remove(chat_id)
        });
        self.with_ledger(|ledger| ledger.forget(chat_id));
        if removed {
            self.notify();
        }
    }

    /// Zero the unread counter of exactly this chat and remember the read time.
    pub fn mark_chat_as_read(&self, chat_id: &str) -> bool {
        let (changed, chat_time) = self.with_state(|s| {
            let time = s.list.get(chat_id).map(|c| c.time).unwrap_or(0);
            (s.list.mark_read(chat_id), time)
        });
        let read_at = wire::now_secs().max(chat_time);
        self.with_ledger(|ledger| ledger.mark_read(chat_id, read_at));
        if changed {
            self.notify();
        }
        changed
    }

    /// The chat currently on screen. Its inbound messages do not count as unread.
    pub fn set_active_chat(&self, chat_id: Option<&str>) {
        self.with_state(|s| s.active = chat_id.map(String::from));
        if let Some(id) = chat_id {
            self.mark_chat_as_read(id);
        }
    }

    pub fn active_chat(&self) -> Option<String> {
        self.with_state(|s| s.active.clone())
    }

    /// Polling only runs while visible.
    pub fn set_visible(&self, visible: bool) {
        self.with_state(|s| s.visible = visible);
    }

    /// Merge one realtime event.
    pub fn handle_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::NewMessage { message, .. } => {
                let bumped = self.with_state(|s| {
                    let active = s.active.as_deref() == Some(message.chat_id.as_str());
                    s.list.apply_message(message, active)
                });
                if bumped {
                    self.with_ledger(|ledger| ledger.increment(&message.chat_id, message.timestamp));
                }
                self.notify();
            }
            SyncEvent::ChatUpdated(chat) => {
                let mut chat = chat.clone();
                self.with_ledger(|ledger| ledger.reconcile(&mut chat));
                self.with_state(|s| {
                    if let Some(existing) = s.list.get(&chat.id) {
                        if chat.last_message.is_none() {
                            chat.last_message = existing.last_message.clone();
                        }
                        chat.time = chat.time.max(existing.time);
                    }
                    s.list.upsert(chat);
                });
                self.notify();
            }
            SyncEvent::ChatDeleted { chat_id } => self.forget(chat_id),
            SyncEvent::Ready
            | SyncEvent::MessageUpdated { .. }
            | SyncEvent::MessageDeleted { .. } => {}
        }
    }

    /// Whether the poller should fetch given the connection state.
    pub fn should_poll(&self, state: ConnectionState) -> bool {
        let realtime_up = self.inner.realtime && state == ConnectionState::Connected;
        self.with_state(|s| s.loaded && s.visible) && !realtime_up
    }

    /// Poll every `poll_interval` while `should_poll` holds. The decision is
    /// re-evaluated on every tick against the latest connection state.
    pub fn spawn_poller(&self, state: watch::Receiver<ConnectionState>) -> PollerHandle {
        let sync = self.clone();
        let period = self.inner.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; the initial load is the caller's.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let current = *state.borrow();
                if !sync.should_poll(current) {
                    continue;
                }
                let search = sync.search_query();
                tracing::debug!("Polling chats (connection {})", current.as_str());
                if let Err(e) = sync.load_chats(true, search.as_deref()).await {
                    tracing::debug!("Poll failed: {:#}", e);
                }
            }
        });
        PollerHandle { task }
    }
}
