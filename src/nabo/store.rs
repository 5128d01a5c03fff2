//! Message store.
//!
//! Single writer for message rows. Keeps one ordered sequence per
//! conversation plus an id index covering both temp and server ids.
//! Ordering is by `(created_at, server id)` with `created_at` dominant;
//! optimistic records (no server id yet) sort after any server record
//! with the same timestamp, which keeps them at the visual tail until
//! reconciliation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::nabo::message::{DeliveryStatus, Message, ReactionSummary};
use crate::types::{ConversationId, MessageId, UserId};

/// What an append call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The message was new and got inserted.
    Appended,
    /// A record with the same id already existed; it was patched in
    /// place and the store size did not change.
    Patched,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    threads: HashMap<ConversationId, Vec<Message>>,
    /// id (temp or server) -> owning conversation
    locations: HashMap<MessageId, ConversationId>,
}

fn sort_key(message: &Message) -> (DateTime<Utc>, bool, &str) {
    // Optimistic records sort after server records at equal timestamps;
    // server id is the final tiebreaker.
    (
        message.created_at,
        message.is_optimistic(),
        message.server_id.as_deref().unwrap_or(""),
    )
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a conversation's sequence with an initial page.
    pub fn load_initial(&mut self, conversation_id: &ConversationId, messages: Vec<Message>) {
        if let Some(old) = self.threads.remove(conversation_id) {
            for message in &old {
                self.locations.remove(&message.id);
            }
        }
        let mut thread = messages;
        thread.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        thread.dedup_by(|a, b| a.id == b.id);
        for message in &thread {
            self.locations
                .insert(message.id.clone(), conversation_id.clone());
        }
        self.threads.insert(conversation_id.clone(), thread);
    }

    /// Merge an older page in front of the existing window. Messages
    /// already present (by id) are skipped.
    pub fn prepend(&mut self, conversation_id: &ConversationId, page: Vec<Message>) {
        let thread = self.threads.entry(conversation_id.clone()).or_default();
        for message in page {
            if self.locations.contains_key(&message.id) {
                continue;
            }
            self.locations
                .insert(message.id.clone(), conversation_id.clone());
            thread.push(message);
        }
        thread.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    }

    /// Insert one message at its ordered position. If the id is already
    /// known the existing record is patched instead and the store size
    /// does not change.
    pub fn append(&mut self, message: Message) -> AppendOutcome {
        if self.locations.contains_key(&message.id) {
            let incoming = message.clone();
            self.patch(&message.id, |existing| {
                existing.content = incoming.content;
                existing.is_edited = incoming.is_edited;
                existing.edited_at = incoming.edited_at;
                existing.advance_status(incoming.status);
                if !incoming.reactions.is_empty() {
                    existing.reactions = incoming.reactions;
                }
            });
            return AppendOutcome::Patched;
        }

        let conversation_id = message.conversation_id.clone();
        self.locations
            .insert(message.id.clone(), conversation_id.clone());
        let thread = self.threads.entry(conversation_id).or_default();
        let position = thread.partition_point(|m| sort_key(m) <= sort_key(&message));
        thread.insert(position, message);
        AppendOutcome::Appended
    }

    /// Atomically swap an optimistic record for its server-confirmed
    /// counterpart. The temp record is removed and the new record is
    /// inserted at its true ordered position; observers never see both
    /// or neither. Returns false when `old_id` is unknown.
    pub fn replace(&mut self, old_id: &MessageId, new_message: Message) -> bool {
        let Some(conversation_id) = self.locations.get(old_id).cloned() else {
            return false;
        };
        let Some(thread) = self.threads.get_mut(&conversation_id) else {
            return false;
        };
        let Some(position) = thread.iter().position(|m| &m.id == old_id) else {
            return false;
        };
        thread.remove(position);
        self.locations.remove(old_id);

        // The reconciled record may already be present if the echo
        // arrived through another path; avoid a duplicate.
        if self.locations.contains_key(&new_message.id) {
            return true;
        }
        self.locations
            .insert(new_message.id.clone(), conversation_id);
        let insert_at = thread.partition_point(|m| sort_key(m) <= sort_key(&new_message));
        thread.insert(insert_at, new_message);
        true
    }

    /// Apply a mutation to one message. Returns false when unknown.
    pub fn patch<F>(&mut self, id: &MessageId, f: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        let Some(conversation_id) = self.locations.get(id) else {
            return false;
        };
        let Some(message) = self
            .threads
            .get_mut(conversation_id)
            .and_then(|t| t.iter_mut().find(|m| &m.id == id))
        else {
            return false;
        };
        f(message);
        true
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let conversation_id = self.locations.remove(id)?;
        let thread = self.threads.get_mut(&conversation_id)?;
        let position = thread.iter().position(|m| &m.id == id)?;
        Some(thread.remove(position))
    }

    /// Overwrite a message's reactions with the server-authoritative
    /// summary, normalized so counts match user sets.
    pub fn merge_reactions(&mut self, id: &MessageId, reactions: ReactionSummary) -> bool {
        let normalized = ReactionSummary::normalized(reactions.by_kind.into_values().collect());
        self.patch(id, |message| message.reactions = normalized)
    }

    pub fn mark_read(&mut self, id: &MessageId, viewer: UserId, at: DateTime<Utc>) -> bool {
        self.patch(id, |message| message.mark_read_by(viewer, at))
    }

    pub fn mark_failed(&mut self, id: &MessageId) -> bool {
        self.patch(id, |message| {
            message.advance_status(DeliveryStatus::Failed);
        })
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        let conversation_id = self.locations.get(id)?;
        self.threads
            .get(conversation_id)?
            .iter()
            .find(|m| &m.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.locations.contains_key(id)
    }

    /// Conversation owning a message id, if known.
    pub fn locate(&self, id: &MessageId) -> Option<&ConversationId> {
        self.locations.get(id)
    }

    /// Full ordered sequence, including records hidden by soft delete.
    pub fn thread(&self, conversation_id: &ConversationId) -> &[Message] {
        self.threads
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ordered sequence as one viewer sees it.
    pub fn visible_thread(
        &self,
        conversation_id: &ConversationId,
        viewer: &UserId,
    ) -> Vec<&Message> {
        self.thread(conversation_id)
            .iter()
            .filter(|m| m.visible_to(viewer))
            .collect()
    }

    pub fn thread_len(&self, conversation_id: &ConversationId) -> usize {
        self.threads.get(conversation_id).map_or(0, Vec::len)
    }

    /// Drop a whole conversation's messages.
    pub fn drop_conversation(&mut self, conversation_id: &ConversationId) {
        if let Some(thread) = self.threads.remove(conversation_id) {
            for message in &thread {
                self.locations.remove(&message.id);
            }
        }
    }
}
