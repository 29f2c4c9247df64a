//! Message-related models

use serde::{Deserialize, Serialize};

/// Who wrote a message, from the local user's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    Me,
    Them,
}

/// Delivery status reported by the gateway (or `Failed` locally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    /// Parse an upstream status string. Unknown values (and `pending`) map to `Sent`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "delivered" => DeliveryStatus::Delivered,
            "read" | "seen" => DeliveryStatus::Read,
            "failed" | "error" | "noaccount" | "notingroup" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Sent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    /// Classify by MIME type prefix.
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime == "image/webp" {
            MediaKind::Sticker
        } else if mime.starts_with("image/") {
            MediaKind::Image
        } else if mime.starts_with("video/") {
            MediaKind::Video
        } else if mime.starts_with("audio/") {
            MediaKind::Audio
        } else {
            MediaKind::Document
        }
    }

    /// Parse an upstream type tag (`image`, `imageMessage`, `document_message`, ...).
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        let tag = tag.to_ascii_lowercase();
        if tag.starts_with("image") {
            Some(MediaKind::Image)
        } else if tag.starts_with("video") {
            Some(MediaKind::Video)
        } else if tag.starts_with("audio") || tag.starts_with("ptt") || tag.starts_with("voice") {
            Some(MediaKind::Audio)
        } else if tag.starts_with("document") || tag.starts_with("file") {
            Some(MediaKind::Document)
        } else if tag.starts_with("sticker") {
            Some(MediaKind::Sticker)
        } else {
            None
        }
    }

    /// Upload route suffix (`/api/files/upload-<suffix>`).
    pub fn upload_suffix(&self) -> &'static str {
        match self {
            MediaKind::Image | MediaKind::Sticker => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Image => "[image]",
            MediaKind::Video => "[video]",
            MediaKind::Audio => "[audio]",
            MediaKind::Document => "[document]",
            MediaKind::Sticker => "[sticker]",
        }
    }
}

/// Media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub url: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub kind: MediaKind,
}

/// Reduced media descriptor kept inside a quoted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStub {
    pub kind: MediaKind,
    pub url: Option<String>,
}

/// Snapshot of the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub message_id: String,
    pub author: Author,
    pub text: String,
    pub media: Option<MediaStub>,
}

impl ReplyRef {
    /// Snapshot a message so it can be quoted.
    pub fn from_message(msg: &Message) -> Self {
        Self {
            message_id: msg.id.clone(),
            author: msg.author,
            text: msg.text.clone(),
            media: msg.media.as_ref().map(|m| MediaStub {
                kind: m.kind,
                url: Some(m.url.clone()),
            }),
        }
    }
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Resolved id: the server id once known, else the temporary id.
    pub id: String,
    /// Locally generated id of an optimistic send. Kept after confirmation
    /// so cached reply metadata can still be found.
    pub temp_id: Option<String>,
    pub chat_id: String,
    pub author: Author,
    pub text: String,
    pub media: Option<Media>,
    pub reply_to: Option<ReplyRef>,
    pub status: DeliveryStatus,
    /// Optimistic entry not yet confirmed by the server.
    pub pending: bool,
    /// Creation time, unix seconds.
    pub timestamp: i64,
    /// Sender display name, when the gateway provides one.
    pub sender_name: Option<String>,
}

impl Message {
    /// Build an optimistic outgoing message with a fresh temporary id.
    pub fn optimistic(chat_id: &str, text: &str, timestamp: i64) -> Self {
        let temp_id = new_temp_id();
        Self {
            id: temp_id.clone(),
            temp_id: Some(temp_id),
            chat_id: chat_id.to_string(),
            author: Author::Me,
            text: text.to_string(),
            media: None,
            reply_to: None,
            status: DeliveryStatus::Sent,
            pending: true,
            timestamp,
            sender_name: None,
        }
    }

    pub fn is_outgoing(&self) -> bool {
        self.author == Author::Me
    }

    /// True while only the temporary id is known.
    pub fn is_unconfirmed(&self) -> bool {
        self.temp_id.as_deref() == Some(self.id.as_str())
    }

    /// Adopt the server-assigned id. The temporary id is retained.
    pub fn confirm(&mut self, server_id: &str) {
        if self.temp_id.is_none() {
            self.temp_id = Some(self.id.clone());
        }
        self.id = server_id.to_string();
        self.pending = false;
    }

    pub fn mark_failed(&mut self) {
        self.pending = false;
        self.status = DeliveryStatus::Failed;
    }

    /// One-line preview used for the chat list.
    pub fn preview(&self) -> String {
        match (&self.media, self.text.trim().is_empty()) {
            (Some(media), true) => media.kind.label().to_string(),
            (Some(media), false) => format!("{} {}", media.kind.label(), self.text.trim()),
            (None, _) => self.text.trim().to_string(),
        }
    }
}

/// Temporary ids are `temp-<uuid>`.
pub fn new_temp_id() -> String {
    format!("temp-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_keeps_temp_id() {
        let mut msg = Message::optimistic("1@c.us", "hi", 100);
        let temp = msg.id.clone();
        assert!(msg.is_unconfirmed());
        assert!(temp.starts_with("temp-"));

        msg.confirm("ABC123");
        assert_eq!(msg.id, "ABC123");
        assert_eq!(msg.temp_id.as_deref(), Some(temp.as_str()));
        assert!(!msg.pending);
        assert!(!msg.is_unconfirmed());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(DeliveryStatus::parse("READ"), DeliveryStatus::Read);
        assert_eq!(DeliveryStatus::parse("pending"), DeliveryStatus::Sent);
        assert_eq!(DeliveryStatus::parse("failed"), DeliveryStatus::Failed);
        assert_eq!(DeliveryStatus::parse("whatever"), DeliveryStatus::Sent);
    }

    #[test]
    fn test_media_kind_classification() {
        assert_eq!(MediaKind::from_mime("image/png"), MediaKind::Image);
        assert_eq!(MediaKind::from_mime("image/webp"), MediaKind::Sticker);
        assert_eq!(MediaKind::from_mime("application/pdf"), MediaKind::Document);
        assert_eq!(MediaKind::from_type_tag("imageMessage"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_type_tag("pttMessage"), Some(MediaKind::Audio));
        assert_eq!(MediaKind::from_type_tag("textMessage"), None);
    }

    #[test]
    fn test_preview() {
        let mut msg = Message::optimistic("1@c.us", "  hello ", 0);
        assert_eq!(msg.preview(), "hello");
        msg.text.clear();
        msg.media = Some(Media {
            url: "u".into(),
            mime_type: None,
            size: None,
            kind: MediaKind::Image,
        });
        assert_eq!(msg.preview(), "[image]");
    }
}
