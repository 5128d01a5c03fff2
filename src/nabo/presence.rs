//! Typing indicators.
//!
//! Ephemeral per-conversation state, never persisted. An entry lives
//! for three seconds unless refreshed by another typing event or
//! removed by an explicit stop. Expired entries are dropped both by a
//! lazy sweep on read and by the core's scheduled tick.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;

use crate::types::{ConversationId, UserId};

pub const TYPING_TTL_SECS: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub user_id: UserId,
    pub name: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct TypingTracker {
    entries: DashMap<ConversationId, HashMap<UserId, TypingEntry>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a typing entry with a fresh TTL.
    pub fn started(
        &self,
        conversation_id: &ConversationId,
        user_id: UserId,
        name: String,
        now: DateTime<Utc>,
    ) {
        let entry = TypingEntry {
            user_id: user_id.clone(),
            name,
            expires_at: now + Duration::seconds(TYPING_TTL_SECS),
        };
        self.entries
            .entry(conversation_id.clone())
            .or_default()
            .insert(user_id, entry);
    }

    /// Remove a typing entry immediately.
    pub fn stopped(&self, conversation_id: &ConversationId, user_id: &UserId) {
        if let Some(mut per_conversation) = self.entries.get_mut(conversation_id) {
            per_conversation.remove(user_id);
        }
    }

    /// Users currently typing in a conversation, expired entries
    /// swept out first. Sorted by name for stable rendering.
    pub fn typing_in(&self, conversation_id: &ConversationId, now: DateTime<Utc>) -> Vec<TypingEntry> {
        let Some(mut per_conversation) = self.entries.get_mut(conversation_id) else {
            return Vec::new();
        };
        per_conversation.retain(|_, entry| entry.expires_at > now);
        let mut typing: Vec<TypingEntry> = per_conversation.values().cloned().collect();
        typing.sort_by(|a, b| a.name.cmp(&b.name));
        typing
    }

    /// Drop expired entries everywhere. Called from the scheduled tick.
    pub fn sweep(&self, now: DateTime<Utc>) {
        for mut per_conversation in self.entries.iter_mut() {
            per_conversation.retain(|_, entry| entry.expires_at > now);
        }
        self.entries.retain(|_, per_conversation| !per_conversation.is_empty());
    }

    /// Forget everything for one conversation. Called on switch away.
    pub fn clear_conversation(&self, conversation_id: &ConversationId) {
        self.entries.remove(conversation_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
