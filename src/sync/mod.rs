//! Client-side synchronization of the chat list and the open chat
//!
//! Both synchronizers are cheap cloneable handles. `attach_realtime` feeds
//! them from the connection manager; each synchronizer's `spawn_poller`
//! covers the time the feed is down.

pub mod chats;
pub mod messages;
pub mod reply_cache;
pub mod unread;

#[cfg(test)]
pub(crate) mod testing;

pub use chats::ChatListSync;
pub use messages::{MessageListSync, SendError, SendOutcome};
pub use reply_cache::{CachePolicy, ReplyCache};
pub use unread::UnreadLedger;

use tokio::task::JoinHandle;

use crate::realtime::{normalize, ConnectionManager, HandlerId, SyncEvent};

/// Stops a poller when dropped.
pub struct PollerHandle {
    task: JoinHandle<()>,
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Route every realtime frame into both synchronizers.
///
/// `ws.ready` triggers a silent refresh of the chat list and of the open
/// chat, since anything sent while disconnected was missed.
pub fn attach_realtime(
    conn: &ConnectionManager,
    chats: &ChatListSync,
    messages: &MessageListSync,
) -> HandlerId {
    let chats = chats.clone();
    let messages = messages.clone();
    conn.on_message(move |frame| {
        for event in normalize(frame) {
            if event == SyncEvent::Ready {
                tracing::info!("Realtime feed ready, refreshing");
                refresh(&chats, &messages);
                continue;
            }
            chats.handle_event(&event);
            messages.handle_event(&event);
        }
    })
}

fn refresh(chats: &ChatListSync, messages: &MessageListSync) {
    let chats = chats.clone();
    let messages = messages.clone();
    tokio::spawn(async move {
        let search = chats.search_query();
        if let Err(e) = chats.load_chats(true, search.as_deref()).await {
            tracing::debug!("Refresh after ready failed: {:#}", e);
        }
        if let Some(chat_id) = messages.active_chat() {
            if let Err(e) = messages.load_messages(&chat_id, true).await {
                tracing::debug!("Refresh of {} after ready failed: {:#}", chat_id, e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::realtime::{ConnectionConfig, StaticToken};
    use crate::storage::{MemoryStore, SharedStore};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use crate::sync::testing::{chat, FakeApi};

    #[tokio::test]
    async fn test_frames_reach_both_synchronizers() {
        let api = Arc::new(FakeApi::with_chats(vec![chat("a@c.us", 0, 10), chat("b@c.us", 0, 20)]));
        let store: SharedStore = Arc::new(MemoryStore::new());
        let settings = SyncSettings::default();
        let chats = ChatListSync::new(api.clone(), Arc::clone(&store), &settings);
        let messages = MessageListSync::new(api.clone(), Arc::clone(&store), &settings);
        chats.load_chats(false, None).await.unwrap();
        messages.load_messages("a@c.us", false).await.unwrap();

        let conn = ConnectionManager::new(
            ConnectionConfig {
                url: "ws://127.0.0.1:9/api/ws".into(),
                enabled: false,
                reconnect_delay: Duration::from_secs(5),
            },
            Arc::new(StaticToken("tok".into())),
        );
        let id = attach_realtime(&conn, &chats, &messages);

        conn.dispatch(&json!({
            "type": "message.created",
            "chat_id": "a@c.us",
            "data": {"id_message": "M1", "direction": "in", "text": "new", "timestamp": 30}
        }));

        assert_eq!(messages.messages().len(), 1);
        let first = &chats.chats()[0];
        assert_eq!(first.id, "a@c.us");
        assert_eq!(first.unread, 1);
        assert_eq!(first.last_message.as_deref(), Some("new"));

        let before = api.list_calls.load(Ordering::SeqCst);
        conn.dispatch(&json!({"type": "ws.ready"}));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.list_calls.load(Ordering::SeqCst), before + 1);

        assert!(conn.off_message(id));
        conn.dispatch(&json!({"type": "chat.deleted", "chat_id": "b@c.us"}));
        assert_eq!(chats.chats().len(), 2);
    }
}
