//! Conversation model and registry.
//!
//! The registry is the single owner of [`Conversation`] records. It
//! tracks which conversation is active and keeps the list ordered the
//! way the conversation screen renders it: pinned first, then by last
//! activity, most recent on top.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::nabo::message::{Message, MessageKind};
use crate::types::{ConversationId, MessageId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Group,
    Private,
}

/// The peer side of a private conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Summary of the most recent message, denormalized for list rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastMessage {
    pub message_id: MessageId,
    pub kind: MessageKind,
    pub preview: String,
    pub sender_id: UserId,
    pub sender_name: String,
    pub created_at: DateTime<Utc>,
}

impl LastMessage {
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            kind: message.kind,
            preview: message.preview(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub name: String,
    pub description: Option<String>,

    /// Present for private conversations only
    pub peer: Option<PeerInfo>,

    /// Group member count; members themselves are loaded lazily
    pub member_count: usize,

    pub last_message: Option<LastMessage>,
    pub unread: u32,

    pub muted: bool,
    pub archived: bool,
    pub pinned: bool,

    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Timestamp used for activity ordering: last message, else
    /// creation time.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.created_at)
    }
}

/// Result of a select call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The id was already active; nothing changed.
    AlreadyActive,
    /// A new conversation became active.
    Changed {
        previous: Option<ConversationId>,
        epoch: u64,
    },
}

#[derive(Debug, Default)]
pub struct ConversationRegistry {
    conversations: HashMap<ConversationId, Conversation>,
    active: Option<ConversationId>,
    /// Bumped on every selection change; background fetches tag their
    /// results with the epoch they started under and discard on
    /// mismatch.
    epoch: u64,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry contents with a freshly listed set.
    pub fn load(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        if let Some(active) = &self.active {
            if !self.conversations.contains_key(active) {
                self.active = None;
            }
        }
    }

    /// Insert or replace a single conversation.
    pub fn upsert(&mut self, conversation: Conversation) {
        self.conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.conversations.contains_key(id)
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn ids(&self) -> Vec<ConversationId> {
        self.conversations.keys().cloned().collect()
    }

    /// Make a conversation active. Idempotent: selecting the active id
    /// again is a no-op. A real change clears the new selection's
    /// unread counter and bumps the epoch so stale background fetches
    /// for the previous selection discard themselves.
    pub fn select(&mut self, id: &ConversationId) -> Option<Selection> {
        if !self.conversations.contains_key(id) {
            return None;
        }
        if self.active.as_ref() == Some(id) {
            return Some(Selection::AlreadyActive);
        }

        let previous = self.active.replace(id.clone());
        self.epoch += 1;
        if let Some(conversation) = self.conversations.get_mut(id) {
            conversation.unread = 0;
        }
        Some(Selection::Changed {
            previous,
            epoch: self.epoch,
        })
    }

    /// Conversations sorted for display: pinned above unpinned, then by
    /// last activity descending.
    pub fn list(&self) -> Vec<&Conversation> {
        let mut items: Vec<&Conversation> = self.conversations.values().collect();
        items.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.last_activity().cmp(&a.last_activity()))
        });
        items
    }

    /// Case-insensitive substring search over display name, description
    /// and last-message preview.
    pub fn search(&self, query: &str) -> Vec<&Conversation> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return self.list();
        }
        self.list()
            .into_iter()
            .filter(|c| {
                c.name.to_lowercase().contains(&needle)
                    || c.description
                        .as_ref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
                    || c.last_message
                        .as_ref()
                        .is_some_and(|m| m.preview.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Apply a mutation to one conversation. Returns false when the id
    /// is unknown.
    pub fn update<F>(&mut self, id: &ConversationId, patch: F) -> bool
    where
        F: FnOnce(&mut Conversation),
    {
        match self.conversations.get_mut(id) {
            Some(conversation) => {
                patch(conversation);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &ConversationId) -> Option<Conversation> {
        if self.active.as_ref() == Some(id) {
            self.active = None;
            self.epoch += 1;
        }
        self.conversations.remove(id)
    }

    /// Bump the unread counter unless the conversation is active.
    pub fn increment_unread(&mut self, id: &ConversationId) {
        if self.active.as_ref() == Some(id) {
            return;
        }
        self.update(id, |c| c.unread = c.unread.saturating_add(1));
    }

    pub fn clear_unread(&mut self, id: &ConversationId) {
        self.update(id, |c| c.unread = 0);
    }

    /// Record a new last message and keep ordering inputs fresh.
    pub fn note_message(&mut self, message: &Message) {
        self.update(&message.conversation_id.clone(), |c| {
            let newer = c
                .last_message
                .as_ref()
                .map(|m| message.created_at >= m.created_at)
                .unwrap_or(true);
            if newer {
                c.last_message = Some(LastMessage::from_message(message));
            }
        });
    }

    /// Update presence on every private conversation with this peer.
    pub fn set_peer_presence(
        &mut self,
        user_id: &UserId,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) {
        for conversation in self.conversations.values_mut() {
            if let Some(peer) = conversation.peer.as_mut() {
                if &peer.user_id == user_id {
                    peer.online = online;
                    if last_seen.is_some() {
                        peer.last_seen = last_seen;
                    }
                }
            }
        }
    }
}

/// Minimal group conversation for tests.
#[cfg(test)]
pub(crate) fn test_conversation(id: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        kind: ConversationKind::Group,
        name: format!("Group {id}"),
        description: None,
        peer: None,
        member_count: 3,
        last_message: None,
        unread: 0,
        muted: false,
        archived: false,
        pinned: false,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nabo::message::test_message;
    use chrono::Duration;

    fn registry_with(ids: &[&str]) -> ConversationRegistry {
        let mut registry = ConversationRegistry::new();
        registry.load(ids.iter().map(|id| test_conversation(id)).collect());
        registry
    }

    #[test]
    fn test_select_is_idempotent() {
        let mut registry = registry_with(&["c1", "c2"]);

        let first = registry.select(&"c1".to_string()).unwrap();
        assert!(matches!(first, Selection::Changed { previous: None, .. }));
        let epoch = registry.epoch();

        let second = registry.select(&"c1".to_string()).unwrap();
        assert_eq!(second, Selection::AlreadyActive);
        assert_eq!(registry.epoch(), epoch, "no epoch bump on re-select");
    }

    #[test]
    fn test_select_clears_unread_and_bumps_epoch() {
        let mut registry = registry_with(&["c1", "c2"]);
        registry.update(&"c2".to_string(), |c| c.unread = 4);

        registry.select(&"c1".to_string()).unwrap();
        let epoch = registry.epoch();
        let selection = registry.select(&"c2".to_string()).unwrap();

        assert!(matches!(
            selection,
            Selection::Changed { previous: Some(ref p), .. } if p == "c1"
        ));
        assert_eq!(registry.get(&"c2".to_string()).unwrap().unread, 0);
        assert_eq!(registry.epoch(), epoch + 1);
    }

    #[test]
    fn test_select_unknown_conversation() {
        let mut registry = registry_with(&["c1"]);
        assert!(registry.select(&"nope".to_string()).is_none());
    }

    #[test]
    fn test_list_orders_pinned_then_activity() {
        let mut registry = registry_with(&["old", "new", "pinned"]);
        let base = Utc::now();

        registry.update(&"old".to_string(), |c| {
            c.created_at = base - Duration::hours(2);
        });
        registry.update(&"new".to_string(), |c| {
            c.created_at = base - Duration::hours(1);
        });
        registry.update(&"pinned".to_string(), |c| {
            c.pinned = true;
            c.created_at = base - Duration::hours(5);
        });

        let order: Vec<&str> = registry.list().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["pinned", "new", "old"]);
    }

    #[test]
    fn test_last_message_drives_ordering() {
        let mut registry = registry_with(&["c1", "c2"]);
        let base = Utc::now();
        registry.update(&"c1".to_string(), |c| c.created_at = base - Duration::hours(3));
        registry.update(&"c2".to_string(), |c| c.created_at = base - Duration::hours(2));

        let mut message = test_message("m1");
        message.conversation_id = "c1".to_string();
        message.created_at = base;
        registry.note_message(&message);

        let order: Vec<&str> = registry.list().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["c1", "c2"]);
    }

    #[test]
    fn test_note_message_ignores_older_messages() {
        let mut registry = registry_with(&["c1"]);
        let base = Utc::now();

        let mut newer = test_message("m2");
        newer.created_at = base;
        registry.note_message(&newer);

        let mut older = test_message("m1");
        older.created_at = base - Duration::minutes(5);
        registry.note_message(&older);

        let last = registry
            .get(&"c1".to_string())
            .unwrap()
            .last_message
            .as_ref()
            .unwrap();
        assert_eq!(last.message_id, "m2");
    }

    #[test]
    fn test_search_matches_name_and_preview() {
        let mut registry = registry_with(&["c1", "c2"]);
        registry.update(&"c1".to_string(), |c| c.name = "Garden club".to_string());
        let mut message = test_message("m1");
        message.conversation_id = "c2".to_string();
        message.content = "anyone seen my ladder?".to_string();
        registry.note_message(&message);

        let by_name: Vec<&str> = registry.search("garden").iter().map(|c| c.id.as_str()).collect();
        assert_eq!(by_name, vec!["c1"]);

        let by_preview: Vec<&str> = registry.search("ladder").iter().map(|c| c.id.as_str()).collect();
        assert_eq!(by_preview, vec!["c2"]);
    }

    #[test]
    fn test_unread_not_incremented_for_active() {
        let mut registry = registry_with(&["c1", "c2"]);
        registry.select(&"c1".to_string()).unwrap();

        registry.increment_unread(&"c1".to_string());
        registry.increment_unread(&"c2".to_string());

        assert_eq!(registry.get(&"c1".to_string()).unwrap().unread, 0);
        assert_eq!(registry.get(&"c2".to_string()).unwrap().unread, 1);
    }

    #[test]
    fn test_remove_active_clears_selection() {
        let mut registry = registry_with(&["c1"]);
        registry.select(&"c1".to_string()).unwrap();

        let removed = registry.remove(&"c1".to_string());
        assert!(removed.is_some());
        assert!(registry.active().is_none());
    }

    #[test]
    fn test_peer_presence_updates_private_conversations() {
        let mut registry = ConversationRegistry::new();
        let mut conversation = test_conversation("p1");
        conversation.kind = ConversationKind::Private;
        conversation.peer = Some(PeerInfo {
            user_id: "u9".to_string(),
            online: false,
            last_seen: None,
        });
        registry.load(vec![conversation]);

        registry.set_peer_presence(&"u9".to_string(), true, None);
        let peer = registry
            .get(&"p1".to_string())
            .unwrap()
            .peer
            .as_ref()
            .unwrap();
        assert!(peer.online);

        let seen = Utc::now();
        registry.set_peer_presence(&"u9".to_string(), false, Some(seen));
        let peer = registry
            .get(&"p1".to_string())
            .unwrap()
            .peer
            .as_ref()
            .unwrap();
        assert!(!peer.online);
        assert_eq!(peer.last_seen, Some(seen));
    }
}
