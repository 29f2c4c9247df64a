//! Upstream JSON schema mapping.
//!
//! The gateway has no stable schema: the same field shows up under several
//! names depending on the endpoint and on whether the payload came from REST
//! or from the realtime feed. Every lookup here goes through an ordered list
//! of candidate names; the first one present wins. Payloads missing optional
//! data still map, with defaults filled in.

use serde_json::Value;

use super::{
    is_group_id, Author, Chat, DeliveryStatus, Media, MediaKind, MediaStub, Message, ReplyRef,
};

const ID_KEYS: &[&str] = &["id_message", "idMessage", "message_id", "messageId", "id"];
const CHAT_KEYS: &[&str] = &["chat_id", "chatId", "chat"];
const TEXT_KEYS: &[&str] = &[
    "text",
    "message",
    "textMessage",
    "body",
    "conversation",
    "caption",
];
const TIME_KEYS: &[&str] = &["timestamp", "time", "created_at", "createdAt", "date"];
const MEDIA_URL_KEYS: &[&str] = &["media_url", "mediaUrl", "downloadUrl", "download_url", "url"];
const MIME_KEYS: &[&str] = &["mime_type", "mimeType", "mimetype"];
const SIZE_KEYS: &[&str] = &["file_size", "fileSize", "size"];
const TYPE_KEYS: &[&str] = &["media_type", "mediaType", "typeMessage", "type_message", "type"];
const SENDER_NAME_KEYS: &[&str] = &["sender_name", "senderName", "chat_name", "chatName"];

/// Where quoted-message data may live, highest priority first.
const REPLY_KEYS: &[&str] = &["reply_to", "replyTo", "quoted"];

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current unix time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// First non-null value among `keys`.
fn first<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| v.get(*k))
        .find(|val| !val.is_null())
}

/// First value among `keys` rendered as a non-empty string. Numbers are
/// accepted and stringified since some ids arrive numeric.
fn first_str(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match v.get(*k)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn first_u64(v: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| match v.get(*k)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn first_bool(v: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|k| match v.get(*k)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// Parse a timestamp in seconds, milliseconds, a numeric string, or RFC 3339.
/// Result is unix seconds.
pub fn parse_timestamp(v: &Value) -> Option<i64> {
    let raw = match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => match s.parse::<i64>() {
            Ok(n) => n,
            Err(_) => {
                return chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp())
            }
        },
        _ => return None,
    };
    // Anything past year ~33658 in seconds is really milliseconds.
    if raw > 1_000_000_000_000 {
        Some(raw / 1000)
    } else {
        Some(raw)
    }
}

fn timestamp_of(v: &Value) -> Option<i64> {
    TIME_KEYS
        .iter()
        .filter_map(|k| v.get(*k))
        .find_map(parse_timestamp)
}

/// `me` when the payload says the message went out.
fn author_of(v: &Value) -> Author {
    if let Some(dir) = v.get("direction").and_then(Value::as_str) {
        return if dir.eq_ignore_ascii_case("out") || dir.eq_ignore_ascii_case("outgoing") {
            Author::Me
        } else {
            Author::Them
        };
    }
    if let Some(author) = v.get("author").and_then(Value::as_str) {
        if author == "me" {
            return Author::Me;
        }
        if author == "them" {
            return Author::Them;
        }
    }
    if first_bool(v, &["from_me", "fromMe", "outgoing"]) == Some(true) {
        Author::Me
    } else {
        Author::Them
    }
}

fn media_of(v: &Value) -> Option<Media> {
    let explicit_kind = first_str(v, TYPE_KEYS).and_then(|t| MediaKind::from_type_tag(&t));
    let mime = first_str(v, MIME_KEYS);
    // `url` alone is not enough: text payloads sometimes carry link previews.
    let url = first_str(v, MEDIA_URL_KEYS)?;
    let kind = explicit_kind.or_else(|| mime.as_deref().map(MediaKind::from_mime))?;
    Some(Media {
        url,
        mime_type: mime,
        size: first_u64(v, SIZE_KEYS),
        kind,
    })
}

fn media_stub_of(v: &Value) -> Option<MediaStub> {
    let kind = first_str(v, TYPE_KEYS)
        .and_then(|t| MediaKind::from_type_tag(&t))
        .or_else(|| first_str(v, MIME_KEYS).map(|m| MediaKind::from_mime(&m)))?;
    Some(MediaStub {
        kind,
        url: first_str(v, MEDIA_URL_KEYS),
    })
}

/// Locate quoted-message data on a message payload.
///
/// Checks `reply_to`, `replyTo`, `quoted`, `contextInfo.quotedMessage` and
/// `quotedMessage` in that order.
pub fn reply_of(v: &Value) -> Option<ReplyRef> {
    for key in REPLY_KEYS {
        if let Some(found) = v.get(*key).and_then(|r| reply_from_value(r, None)) {
            return Some(found);
        }
    }

    if let Some(ctx) = v.get("contextInfo") {
        let stanza = first_str(ctx, &["stanzaId", "stanza_id", "quotedMessageId"]);
        if let Some(found) = ctx
            .get("quotedMessage")
            .and_then(|q| reply_from_value(q, stanza.as_deref()))
        {
            return Some(found);
        }
    }

    v.get("quotedMessage")
        .and_then(|q| reply_from_value(q, None))
}

/// Map one quoted-message object. A bare string is taken as the quoted id.
fn reply_from_value(v: &Value, id_hint: Option<&str>) -> Option<ReplyRef> {
    match v {
        Value::String(id) if !id.is_empty() => Some(ReplyRef {
            message_id: id.clone(),
            author: Author::Them,
            text: String::new(),
            media: None,
        }),
        Value::Object(_) => {
            let message_id = first_str(v, &["stanzaId", "id_message", "idMessage", "message_id", "id"])
                .or_else(|| id_hint.map(String::from))?;
            let text = first_str(v, TEXT_KEYS).unwrap_or_default();
            Some(ReplyRef {
                message_id,
                author: author_of(v),
                text,
                media: media_stub_of(v),
            })
        }
        _ => None,
    }
}

/// Message id under any of the known names.
pub fn message_id_of(v: &Value) -> Option<String> {
    first_str(v, ID_KEYS)
}

/// Chat id under any of the known names.
pub fn chat_id_of(v: &Value) -> Option<String> {
    first_str(v, CHAT_KEYS)
}

/// Map a message payload. `fallback_chat` is used when the payload itself
/// does not name its chat (envelopes often carry `chat_id` on the outside).
///
/// Returns `None` when no id or no chat can be determined.
pub fn message_from_value(v: &Value, fallback_chat: Option<&str>) -> Option<Message> {
    if !v.is_object() {
        return None;
    }
    let id = first_str(v, ID_KEYS)?;
    let chat_id = first_str(v, CHAT_KEYS)
        .or_else(|| v.get("senderData").and_then(|s| first_str(s, &["chatId"])))
        .or_else(|| fallback_chat.map(String::from))?;

    let status = first_str(v, &["status", "statusMessage"])
        .map(|s| DeliveryStatus::parse(&s))
        .unwrap_or(DeliveryStatus::Sent);

    Some(Message {
        id,
        temp_id: first_str(v, &["temp_id", "tempId"]),
        chat_id,
        author: author_of(v),
        text: first_str(v, TEXT_KEYS).unwrap_or_default(),
        media: media_of(v),
        reply_to: reply_of(v),
        status,
        pending: false,
        timestamp: timestamp_of(v).unwrap_or_else(now_secs),
        sender_name: first_str(v, SENDER_NAME_KEYS),
    })
}

/// Map a chat payload. Returns `None` without an id.
pub fn chat_from_value(v: &Value) -> Option<Chat> {
    let id = first_str(v, &["chat_id", "chatId", "id"])?;
    let last = first(v, &["last_message", "lastMessage"]);

    let last_message = last.and_then(|lm| match lm {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => message_from_value(lm, Some(&id))
            .map(|m| m.preview())
            .or_else(|| first_str(lm, TEXT_KEYS)),
        _ => None,
    });

    let time = first(v, &["time", "timestamp", "last_message_time", "updated_at", "updatedAt"])
        .and_then(parse_timestamp)
        .or_else(|| last.and_then(timestamp_of))
        .unwrap_or(0);

    let name = first_str(v, &["name", "chat_name", "chatName", "contact_name", "contactName"])
        .unwrap_or_else(|| super::display_phone(&id));

    Some(Chat {
        is_group: first_bool(v, &["is_group", "isGroup"]).unwrap_or_else(|| is_group_id(&id)),
        unread: first_u64(v, &["unread", "unread_count", "unreadCount"])
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0),
        id,
        name,
        last_message,
        time,
    })
}

/// Pull a list out of a response that may be a bare array or an object
/// wrapping the array under one of `keys`.
pub fn extract_list<'a>(v: &'a Value, keys: &[&str]) -> &'a [Value] {
    if let Value::Array(items) = v {
        return items;
    }
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_array))
        .map(|a| a.as_slice())
        .unwrap_or(&[])
}

/// Server message id in a send response (`{id_message}` or `{data: {...}}`).
pub fn sent_message_id(v: &Value) -> Option<String> {
    first_str(v, ID_KEYS).or_else(|| v.get("data").and_then(|d| first_str(d, ID_KEYS)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_mapping() {
        let v = json!({
            "id_message": "BAE5",
            "chat_id": "77012345678@c.us",
            "direction": "out",
            "text": "hello",
            "timestamp": 1_700_000_000,
            "status": "delivered"
        });
        let msg = message_from_value(&v, None).unwrap();
        assert_eq!(msg.id, "BAE5");
        assert_eq!(msg.author, Author::Me);
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.timestamp, 1_700_000_000);
        assert_eq!(msg.status, DeliveryStatus::Delivered);
        assert!(msg.media.is_none());
        assert!(!msg.pending);
    }

    #[test]
    fn test_message_requires_id_and_chat() {
        assert!(message_from_value(&json!({"text": "x", "chat_id": "1@c.us"}), None).is_none());
        assert!(message_from_value(&json!({"id": "x"}), None).is_none());
        let msg = message_from_value(&json!({"id": "x"}), Some("1@c.us")).unwrap();
        assert_eq!(msg.chat_id, "1@c.us");
        assert_eq!(msg.author, Author::Them);
    }

    #[test]
    fn test_timestamp_forms() {
        assert_eq!(parse_timestamp(&json!(1_700_000_000_123i64)), Some(1_700_000_000));
        assert_eq!(parse_timestamp(&json!("1700000000")), Some(1_700_000_000));
        assert_eq!(
            parse_timestamp(&json!("2023-11-14T22:13:20Z")),
            Some(1_700_000_000)
        );
        assert_eq!(parse_timestamp(&json!(null)), None);
    }

    #[test]
    fn test_reply_priority_order() {
        let v = json!({
            "id": "m1",
            "chat_id": "1@c.us",
            "quotedMessage": {"id": "low", "text": "ignored"},
            "replyTo": {"id": "high", "text": "quoted text", "direction": "out"}
        });
        let reply = reply_of(&v).unwrap();
        assert_eq!(reply.message_id, "high");
        assert_eq!(reply.text, "quoted text");
        assert_eq!(reply.author, Author::Me);
    }

    #[test]
    fn test_reply_from_context_info() {
        let v = json!({
            "contextInfo": {
                "stanzaId": "Q1",
                "quotedMessage": {"conversation": "original"}
            }
        });
        let reply = reply_of(&v).unwrap();
        assert_eq!(reply.message_id, "Q1");
        assert_eq!(reply.text, "original");
    }

    #[test]
    fn test_reply_as_bare_id() {
        let reply = reply_of(&json!({"reply_to": "Q9"})).unwrap();
        assert_eq!(reply.message_id, "Q9");
        assert!(reply.text.is_empty());
    }

    #[test]
    fn test_media_mapping() {
        let v = json!({
            "idMessage": 42,
            "chatId": "1@c.us",
            "typeMessage": "imageMessage",
            "downloadUrl": "https://cdn/x.jpg",
            "fileSize": "2048",
            "caption": "look"
        });
        let msg = message_from_value(&v, None).unwrap();
        assert_eq!(msg.id, "42");
        let media = msg.media.unwrap();
        assert_eq!(media.kind, MediaKind::Image);
        assert_eq!(media.size, Some(2048));
        assert_eq!(msg.text, "look");
    }

    #[test]
    fn test_chat_mapping() {
        let v = json!({
            "chat_id": "120363@g.us",
            "name": "Family",
            "unread_count": 3,
            "last_message": {"id": "m", "text": "dinner?", "timestamp": 1_700_000_100}
        });
        let chat = chat_from_value(&v).unwrap();
        assert!(chat.is_group);
        assert_eq!(chat.unread, 3);
        assert_eq!(chat.last_message.as_deref(), Some("dinner?"));
        assert_eq!(chat.time, 1_700_000_100);
    }

    #[test]
    fn test_huge_unread_saturates() {
        let v = json!({"chat_id": "1@c.us", "unread": 4_294_967_296u64});
        assert_eq!(chat_from_value(&v).unwrap().unread, u32::MAX);
    }

    #[test]
    fn test_extract_list() {
        let bare = json!([{"id": 1}]);
        assert_eq!(extract_list(&bare, &["chats"]).len(), 1);
        let wrapped = json!({"data": [{"id": 1}, {"id": 2}]});
        assert_eq!(extract_list(&wrapped, &["chats", "data"]).len(), 2);
        assert!(extract_list(&json!({"error": "x"}), &["chats"]).is_empty());
    }

    #[test]
    fn test_sent_message_id() {
        assert_eq!(sent_message_id(&json!({"idMessage": "A"})).as_deref(), Some("A"));
        assert_eq!(
            sent_message_id(&json!({"data": {"id_message": "B"}})).as_deref(),
            Some("B")
        );
        assert_eq!(sent_message_id(&json!({"ok": true})), None);
    }
}
