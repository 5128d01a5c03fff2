//! Per-conversation broadcast channels for thread updates.
//!
//! Observers subscribe to the conversations they render. Channels are
//! created lazily on first subscribe and cleaned up on emit once every
//! receiver is gone.

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::nabo::message::Message;
use crate::types::ConversationId;

const BUFFER_SIZE: usize = 100;

/// Why a thread update fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTrigger {
    /// A new message entered the thread (live event or optimistic send).
    NewMessage,
    /// Content, edit flags, or reactions of an existing message changed.
    MessageUpdated,
    /// A message left the thread or was hidden by soft delete.
    MessageDeleted,
    /// Delivery status or receipts moved.
    StatusChanged,
    /// The whole window was replaced (initial load, resync, older page).
    WindowReloaded,
}

/// One update for one conversation's thread.
#[derive(Debug, Clone)]
pub struct ThreadUpdate {
    pub trigger: UpdateTrigger,
    pub conversation_id: ConversationId,
    /// The message involved; absent for whole-window triggers.
    pub message: Option<Message>,
}

pub struct ThreadStreamManager {
    streams: DashMap<ConversationId, broadcast::Sender<ThreadUpdate>>,
}

impl ThreadStreamManager {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }

    pub fn subscribe(&self, conversation_id: &ConversationId) -> broadcast::Receiver<ThreadUpdate> {
        self.streams
            .entry(conversation_id.clone())
            .or_insert_with(|| broadcast::channel(BUFFER_SIZE).0)
            .subscribe()
    }

    pub fn emit(&self, conversation_id: &ConversationId, update: ThreadUpdate) {
        if let Some(sender) = self.streams.get(conversation_id) {
            // Attempt to send; if all receivers dropped, clean up
            if sender.send(update).is_err() && sender.receiver_count() == 0 {
                drop(sender);
                self.streams.remove(conversation_id);
            }
        }
    }
}

impl Default for ThreadStreamManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nabo::message::test_message;

    fn make_update(trigger: UpdateTrigger, id: &str) -> ThreadUpdate {
        ThreadUpdate {
            trigger,
            conversation_id: "c1".to_string(),
            message: Some(test_message(id)),
        }
    }

    #[test]
    fn subscribe_creates_new_stream() {
        let manager = ThreadStreamManager::new();
        let conversation_id = "c1".to_string();

        assert!(!manager.streams.contains_key(&conversation_id));

        let _rx = manager.subscribe(&conversation_id);

        assert!(manager.streams.contains_key(&conversation_id));
    }

    #[test]
    fn multiple_subscribes_share_sender() {
        let manager = ThreadStreamManager::new();
        let conversation_id = "c1".to_string();

        let _rx1 = manager.subscribe(&conversation_id);
        let _rx2 = manager.subscribe(&conversation_id);

        assert_eq!(manager.streams.len(), 1);
        let sender = manager.streams.get(&conversation_id).unwrap();
        assert_eq!(sender.receiver_count(), 2);
    }

    #[tokio::test]
    async fn emit_delivers_to_receivers() {
        let manager = ThreadStreamManager::new();
        let conversation_id = "c1".to_string();

        let mut rx = manager.subscribe(&conversation_id);

        manager.emit(&conversation_id, make_update(UpdateTrigger::NewMessage, "m1"));

        let received = rx.try_recv().expect("should receive update");
        assert_eq!(received.message.unwrap().id, "m1");
    }

    #[test]
    fn emit_without_subscribers_is_noop() {
        let manager = ThreadStreamManager::new();
        let conversation_id = "c1".to_string();

        manager.emit(&conversation_id, make_update(UpdateTrigger::NewMessage, "m2"));

        assert!(!manager.streams.contains_key(&conversation_id));
    }

    #[test]
    fn emit_cleans_up_when_all_receivers_dropped() {
        let manager = ThreadStreamManager::new();
        let conversation_id = "c1".to_string();

        let rx = manager.subscribe(&conversation_id);
        drop(rx);

        assert!(manager.streams.contains_key(&conversation_id));

        manager.emit(&conversation_id, make_update(UpdateTrigger::NewMessage, "m3"));

        assert!(!manager.streams.contains_key(&conversation_id));
    }

    #[test]
    fn different_conversations_have_separate_streams() {
        let manager = ThreadStreamManager::new();
        let c1 = "c1".to_string();
        let c2 = "c2".to_string();

        let _rx1 = manager.subscribe(&c1);
        let _rx2 = manager.subscribe(&c2);

        assert_eq!(manager.streams.len(), 2);
    }
}
