//! Realtime frame normalization
//!
//! Frames are JSON envelopes `{"type": ..., "data": ..., "chat_id": ...}`.
//! Known types map to typed events. Frames with a missing or unknown type go
//! through a fallback that looks for a message-shaped payload under
//! `data.message`, `message`, `data`, `payload` and finally the envelope
//! itself, and reports the first hit as a new message.

use serde_json::Value;

use crate::models::{wire, Chat, Message};

/// Typed event produced from one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Server finished the handshake.
    Ready,
    NewMessage { chat_id: String, message: Message },
    MessageUpdated { chat_id: String, message: Message },
    MessageDeleted { chat_id: String, message_id: String },
    ChatUpdated(Chat),
    ChatDeleted { chat_id: String },
}

/// Envelope `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Ready,
    MessageCreated,
    MessageUpdated,
    MessageDeleted,
    ChatUpdated,
    ChatDeleted,
    Unknown,
}

impl FrameKind {
    fn parse(tag: Option<&str>) -> Self {
        match tag {
            Some("ws.ready") => FrameKind::Ready,
            Some("message.created") | Some("message.new") => FrameKind::MessageCreated,
            Some("message.updated") | Some("message.status") => FrameKind::MessageUpdated,
            Some("message.deleted") => FrameKind::MessageDeleted,
            Some("chat.updated") | Some("chat.created") => FrameKind::ChatUpdated,
            Some("chat.deleted") => FrameKind::ChatDeleted,
            _ => FrameKind::Unknown,
        }
    }
}

/// The part of the envelope carrying the entity.
fn payload_of(frame: &Value) -> &Value {
    ["data", "message", "payload"]
        .iter()
        .filter_map(|k| frame.get(*k))
        .find(|v| v.is_object())
        .unwrap_or(frame)
}

/// Chat id from the envelope, else from the payload.
fn envelope_chat_id(frame: &Value, payload: &Value) -> Option<String> {
    wire::chat_id_of(frame).or_else(|| wire::chat_id_of(payload))
}

/// Map one decoded frame to zero or more events.
pub fn normalize(frame: &Value) -> Vec<SyncEvent> {
    let tag = frame.get("type").and_then(Value::as_str);
    let payload = payload_of(frame);
    let chat_id = envelope_chat_id(frame, payload);

    let event = match FrameKind::parse(tag) {
        FrameKind::Ready => Some(SyncEvent::Ready),
        FrameKind::MessageCreated => {
            wire::message_from_value(payload, chat_id.as_deref()).map(|message| {
                SyncEvent::NewMessage {
                    chat_id: message.chat_id.clone(),
                    message,
                }
            })
        }
        FrameKind::MessageUpdated => {
            wire::message_from_value(payload, chat_id.as_deref()).map(|message| {
                SyncEvent::MessageUpdated {
                    chat_id: message.chat_id.clone(),
                    message,
                }
            })
        }
        FrameKind::MessageDeleted => {
            let message_id = wire::message_id_of(payload).or_else(|| wire::message_id_of(frame));
            match (chat_id, message_id) {
                (Some(chat_id), Some(message_id)) => Some(SyncEvent::MessageDeleted {
                    chat_id,
                    message_id,
                }),
                _ => None,
            }
        }
        FrameKind::ChatUpdated => wire::chat_from_value(payload).map(SyncEvent::ChatUpdated),
        FrameKind::ChatDeleted => chat_id
            .or_else(|| payload.get("id").and_then(Value::as_str).map(String::from))
            .map(|chat_id| SyncEvent::ChatDeleted { chat_id }),
        FrameKind::Unknown => fallback_message(frame),
    };

    if event.is_none() {
        tracing::debug!("Frame produced no event (type={:?})", tag);
    }
    event.into_iter().collect()
}

/// Heuristic for untyped frames: the first candidate that maps to a message
/// with some content wins.
fn fallback_message(frame: &Value) -> Option<SyncEvent> {
    let outer_chat = wire::chat_id_of(frame);
    let candidates = [
        frame.get("data").and_then(|d| d.get("message")),
        frame.get("message"),
        frame.get("data"),
        frame.get("payload"),
        Some(frame),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter_map(|c| wire::message_from_value(c, outer_chat.as_deref()))
        .find(|m| !m.text.is_empty() || m.media.is_some())
        .map(|message| SyncEvent::NewMessage {
            chat_id: message.chat_id.clone(),
            message,
        })
}
