//! Per-chat cache of quoted-message snapshots.
//!
//! The gateway does not reliably return quoted content on later fetches, so
//! whatever we showed at send time is remembered here, keyed by
//! `<chatId>-<messageId>`, under the store key `reply-cache-<chatId>`.
//! Entries expire after the TTL and the oldest are evicted beyond the cap.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::SyncSettings;
use crate::models::wire::now_millis;
use crate::models::ReplyRef;
use crate::storage::SharedStore;

const KEY_PREFIX: &str = "reply-cache-";

/// Expiry and size bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl CachePolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            ttl: Duration::from_secs(settings.reply_cache_ttl_secs),
            max_entries: settings.reply_cache_max_entries,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedReply {
    reply: ReplyRef,
    /// Unix milliseconds.
    cached_at: i64,
}

pub struct ReplyCache {
    chat_id: String,
    store: SharedStore,
    policy: CachePolicy,
    entries: HashMap<String, CachedReply>,
}

impl ReplyCache {
    /// Load the cache for `chat_id`, dropping expired entries.
    pub fn load(store: SharedStore, chat_id: &str, policy: CachePolicy) -> Self {
        Self::load_at(store, chat_id, policy, now_millis())
    }

    fn load_at(store: SharedStore, chat_id: &str, policy: CachePolicy, now_ms: i64) -> Self {
        let key = store_key(chat_id);
        let mut entries: HashMap<String, CachedReply> = match store.get(&key) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Discarding unreadable reply cache {}: {}", key, e);
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(e) => {
                tracing::warn!("Failed to read reply cache {}: {:#}", key, e);
                HashMap::new()
            }
        };

        let before = entries.len();
        let ttl_ms = policy.ttl.as_millis() as i64;
        entries.retain(|_, e| now_ms - e.cached_at < ttl_ms);

        let mut cache = Self {
            chat_id: chat_id.to_string(),
            store,
            policy,
            entries,
        };
        let evicted = cache.evict_overflow();
        if cache.entries.len() != before || evicted {
            tracing::debug!(
                "Reply cache {}: dropped {} stale entries",
                chat_id,
                before - cache.entries.len()
            );
            cache.persist();
        }
        cache
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_key(&self, message_id: &str) -> String {
        format!("{}-{}", self.chat_id, message_id)
    }

    /// Remember the quoted message shown for `message_id`.
    pub fn cache_reply(&mut self, message_id: &str, reply: &ReplyRef) {
        self.cache_reply_at(message_id, reply, now_millis());
    }

    fn cache_reply_at(&mut self, message_id: &str, reply: &ReplyRef, now_ms: i64) {
        let key = self.entry_key(message_id);
        self.entries.insert(
            key,
            CachedReply {
                reply: reply.clone(),
                cached_at: now_ms,
            },
        );
        self.evict_overflow();
        self.persist();
    }

    /// Cached quote for `message_id`, unless expired.
    pub fn get_reply(&self, message_id: &str) -> Option<ReplyRef> {
        self.get_reply_at(message_id, now_millis())
    }

    fn get_reply_at(&self, message_id: &str, now_ms: i64) -> Option<ReplyRef> {
        let entry = self.entries.get(&self.entry_key(message_id))?;
        if now_ms - entry.cached_at >= self.policy.ttl.as_millis() as i64 {
            return None;
        }
        Some(entry.reply.clone())
    }

    /// Drop the oldest entries beyond the cap. Returns true if any went.
    fn evict_overflow(&mut self) -> bool {
        let excess = self.entries.len().saturating_sub(self.policy.max_entries);
        if excess == 0 {
            return false;
        }
        let mut by_age: Vec<(String, i64)> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.cached_at))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        for (key, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        true
    }

    fn persist(&self) {
        let key = store_key(&self.chat_id);
        let result = if self.entries.is_empty() {
            self.store.remove(&key)
        } else {
            serde_json::to_string(&self.entries)
                .map_err(anyhow::Error::from)
                .and_then(|raw| self.store.set(&key, &raw))
        };
        if let Err(e) = result {
            tracing::warn!("Failed to persist reply cache {}: {:#}", key, e);
        }
    }
}

fn store_key(chat_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, chat_id)
}
