//! Local unread ledger
//!
//! The gateway's unread counters lag behind what the user has already seen
//! here, so counts of realtime arrivals and the time each chat was last read
//! are kept locally and folded into every refreshed chat list.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::Chat;
use crate::storage::SharedStore;

const UNREAD_KEY: &str = "whatsapp_unread_messages";
const LAST_READ_KEY: &str = "whatsapp_last_read_timestamps";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct UnreadEntry {
    count: u32,
    /// Unix seconds of the latest increment.
    updated_at: i64,
}

pub struct UnreadLedger {
    store: SharedStore,
    max_entries: usize,
    counts: HashMap<String, UnreadEntry>,
    /// Chat id -> unix seconds of the last `mark_read`.
    last_read: HashMap<String, i64>,
}

fn load_map<T: for<'de> Deserialize<'de>>(store: &SharedStore, key: &str) -> HashMap<String, T> {
    match store.get(key) {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!("Discarding unreadable {}: {}", key, e);
            HashMap::new()
        }),
        Ok(None) => HashMap::new(),
        Err(e) => {
            tracing::warn!("Failed to read {}: {:#}", key, e);
            HashMap::new()
        }
    }
}

fn save_map<T: Serialize>(store: &SharedStore, key: &str, map: &HashMap<String, T>) {
    let result = serde_json::to_string(map)
        .map_err(anyhow::Error::from)
        .and_then(|raw| store.set(key, &raw));
    if let Err(e) = result {
        tracing::warn!("Failed to persist {}: {:#}", key, e);
    }
}

/// Keep only the `max` entries with the largest `age_of`.
fn trim_oldest<T>(map: &mut HashMap<String, T>, max: usize, age_of: impl Fn(&T) -> i64) {
    let excess = map.len().saturating_sub(max);
    if excess == 0 {
        return;
    }
    let mut by_age: Vec<(String, i64)> = map.iter().map(|(k, v)| (k.clone(), age_of(v))).collect();
    by_age.sort_by_key(|(_, at)| *at);
    for (key, _) in by_age.into_iter().take(excess) {
        map.remove(&key);
    }
}

impl UnreadLedger {
    pub fn load(store: SharedStore, max_entries: usize) -> Self {
        let counts = load_map(&store, UNREAD_KEY);
        let last_read = load_map(&store, LAST_READ_KEY);
        Self {
            store,
            max_entries,
            counts,
            last_read,
        }
    }

    pub fn count(&self, chat_id: &str) -> u32 {
        self.counts.get(chat_id).map_or(0, |e| e.count)
    }

    pub fn last_read(&self, chat_id: &str) -> Option<i64> {
        self.last_read.get(chat_id).copied()
    }

    /// Record one unseen arrival.
    pub fn increment(&mut self, chat_id: &str, at: i64) {
        let entry = self.counts.entry(chat_id.to_string()).or_insert(UnreadEntry {
            count: 0,
            updated_at: at,
        });
        entry.count = entry.count.saturating_add(1);
        entry.updated_at = entry.updated_at.max(at);
        trim_oldest(&mut self.counts, self.max_entries, |e| e.updated_at);
        save_map(&self.store, UNREAD_KEY, &self.counts);
    }

    /// Clear the count and remember when the chat was read.
    pub fn mark_read(&mut self, chat_id: &str, at: i64) {
        self.counts.remove(chat_id);
        self.last_read.insert(chat_id.to_string(), at);
        trim_oldest(&mut self.last_read, self.max_entries, |t| *t);
        save_map(&self.store, UNREAD_KEY, &self.counts);
        save_map(&self.store, LAST_READ_KEY, &self.last_read);
    }

    /// Forget a chat entirely (after deletion).
    pub fn forget(&mut self, chat_id: &str) {
        let had_count = self.counts.remove(chat_id).is_some();
        let had_read = self.last_read.remove(chat_id).is_some();
        if had_count {
            save_map(&self.store, UNREAD_KEY, &self.counts);
        }
        if had_read {
            save_map(&self.store, LAST_READ_KEY, &self.last_read);
        }
    }

    /// Fold local knowledge into a chat fetched from the gateway.
    ///
    /// Nothing newer than the last read -> 0 unread. Otherwise the larger of
    /// the server count and the local count.
    pub fn reconcile(&self, chat: &mut Chat) {
        if let Some(read_at) = self.last_read(&chat.id) {
            if chat.time <= read_at {
                chat.unread = 0;
                return;
            }
        }
        chat.unread = chat.unread.max(self.count(&chat.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KeyValueStore, MemoryStore};
    use std::sync::Arc;

    fn chat(id: &str, unread: u32, time: i64) -> Chat {
        let mut c = Chat::synthesize(id, None, time);
        c.unread = unread;
        c
    }

    #[test]
    fn test_increment_and_mark_read_persist() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut ledger = UnreadLedger::load(Arc::clone(&store), 100);
        ledger.increment("a", 10);
        ledger.increment("a", 11);
        assert_eq!(ledger.count("a"), 2);

        let reloaded = UnreadLedger::load(Arc::clone(&store), 100);
        assert_eq!(reloaded.count("a"), 2);

        ledger.mark_read("a", 20);
        assert_eq!(ledger.count("a"), 0);
        let reloaded = UnreadLedger::load(Arc::clone(&store), 100);
        assert_eq!(reloaded.last_read("a"), Some(20));
        assert!(store.get(LAST_READ_KEY).unwrap().is_some());
    }

    #[test]
    fn test_reconcile() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut ledger = UnreadLedger::load(store, 100);
        ledger.mark_read("read", 100);
        ledger.increment("bumped", 50);
        ledger.increment("bumped", 51);

        // Server still reports unread, but nothing arrived since we read it.
        let mut c = chat("read", 4, 90);
        ledger.reconcile(&mut c);
        assert_eq!(c.unread, 0);

        // Newer activity after the read keeps the server count.
        let mut c = chat("read", 1, 120);
        ledger.reconcile(&mut c);
        assert_eq!(c.unread, 1);

        // Local count wins when larger.
        let mut c = chat("bumped", 0, 60);
        ledger.reconcile(&mut c);
        assert_eq!(c.unread, 2);
    }

    #[test]
    fn test_cap_trims_oldest() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut ledger = UnreadLedger::load(store, 2);
        ledger.mark_read("a", 1);
        ledger.mark_read("b", 2);
        ledger.mark_read("c", 3);
        assert_eq!(ledger.last_read("a"), None);
        assert_eq!(ledger.last_read("c"), Some(3));

        ledger.increment("x", 1);
        ledger.increment("y", 2);
        ledger.increment("z", 3);
        assert_eq!(ledger.count("x"), 0);
        assert_eq!(ledger.count("z"), 1);
    }

    #[test]
    fn test_forget() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut ledger = UnreadLedger::load(store, 10);
        ledger.increment("a", 1);
        ledger.mark_read("b", 1);
        ledger.forget("a");
        ledger.forget("b");
        assert_eq!(ledger.count("a"), 0);
        assert_eq!(ledger.last_read("b"), None);
    }
}
