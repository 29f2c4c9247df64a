//! Chat-related models

use serde::{Deserialize, Serialize};

/// Prefix of client-only chats that have not been created upstream yet.
pub const TEMP_CHAT_PREFIX: &str = "temp:";

/// Chat entity as shown in the chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Provider id, e.g. `77012345678@c.us` or `<id>@g.us`.
    pub id: String,
    pub name: String,
    /// Preview of the most recent message.
    pub last_message: Option<String>,
    pub unread: u32,
    /// Last update, unix seconds.
    pub time: i64,
    pub is_group: bool,
}

impl Chat {
    /// Build a chat entry for an id we have never seen before.
    ///
    /// Used when an inbound message references an unknown chat.
    pub fn synthesize(id: &str, sender_name: Option<&str>, time: i64) -> Self {
        let name = sender_name
            .filter(|n| !n.trim().is_empty())
            .map(String::from)
            .unwrap_or_else(|| display_phone(id));
        Self {
            id: id.to_string(),
            name,
            last_message: None,
            unread: 0,
            time,
            is_group: is_group_id(id),
        }
    }

    pub fn has_unread(&self) -> bool {
        self.unread > 0
    }
}

/// Group chats carry the `@g.us` suffix.
pub fn is_group_id(id: &str) -> bool {
    id.ends_with("@g.us")
}

/// Whether the id names a client-only placeholder chat.
pub fn is_temp_chat(id: &str) -> bool {
    id.starts_with(TEMP_CHAT_PREFIX)
}

/// Temporary chat id for a phone number (`temp:<phone>`).
pub fn temp_chat_id(phone: &str) -> String {
    format!("{}{}", TEMP_CHAT_PREFIX, normalize_phone(phone))
}

/// Phone number behind a temporary chat id.
pub fn temp_chat_phone(id: &str) -> Option<&str> {
    id.strip_prefix(TEMP_CHAT_PREFIX)
}

/// Strip everything but digits (`+7 701 234-56-78` -> `77012345678`).
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Human label for a chat id: the part before `@`, prefixed with `+` for
/// personal chats.
pub fn display_phone(id: &str) -> String {
    let local = id.split('@').next().unwrap_or(id);
    if id.ends_with("@c.us") && local.chars().all(|c| c.is_ascii_digit()) {
        format!("+{}", local)
    } else {
        local.to_string()
    }
}
