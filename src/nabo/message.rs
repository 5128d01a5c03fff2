//! Message data model.
//!
//! A [`Message`] is the canonical in-memory shape of a chat message,
//! shared by the store, the history cache, and the outbound pipeline.
//! Wire-format quirks are normalized away at the transport boundary;
//! nothing in here knows about `_id` vs `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{ConversationId, MessageId, UserId};

/// Kind of message content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Document,
    Location,
    Contact,
    System,
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Text
    }
}

/// Delivery status of a message, monotone along
/// queued -> sending -> sent -> delivered -> read. `Failed` is entered
/// from queued/sending and exited only by a retry (back to sending).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Sending => 1,
            Self::Sent => 2,
            Self::Delivered => 3,
            Self::Read => 4,
            // Failed sits outside the monotone chain
            Self::Failed => 0,
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        match (self, next) {
            (Self::Failed, Self::Sending) => true,
            (Self::Failed, _) => false,
            (Self::Queued | Self::Sending, Self::Failed) => true,
            (_, Self::Failed) => false,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl Default for DeliveryStatus {
    fn default() -> Self {
        Self::Queued
    }
}

/// Descriptor of a file attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Attachment {
    pub id: String,
    pub kind: String,
    pub size: u64,
    pub uri: String,
    pub thumbnail_uri: Option<String>,
}

/// Denormalized snapshot of the message a reply targets. Immutable once
/// the reply is created, so replies survive edits and deletions of the
/// target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplySnapshot {
    pub message_id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    pub sender_name: String,
    pub kind: MessageKind,
}

/// Provenance of a forwarded message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardInfo {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub conversation_id: ConversationId,
    pub forwarded_by: UserId,
}

/// A delivery or read receipt from one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub user_id: UserId,
    pub at: DateTime<Utc>,
}

/// One reaction kind on a message: its user set and derived count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionGroup {
    pub kind: String,
    pub count: usize,
    pub users: Vec<UserId>,
}

/// All reactions on a message, grouped by reaction kind. A kind appears
/// at most once; its user set is unique; `count` always equals the user
/// set size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReactionSummary {
    pub by_kind: HashMap<String, ReactionGroup>,
}

impl ReactionSummary {
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    /// Total number of individual reactions.
    pub fn total(&self) -> usize {
        self.by_kind.values().map(|g| g.count).sum()
    }

    /// The reaction kind a user currently has on this message, if any.
    pub fn kind_for_user(&self, user: &UserId) -> Option<&str> {
        self.by_kind
            .values()
            .find(|g| g.users.contains(user))
            .map(|g| g.kind.as_str())
    }

    /// Toggle a user's reaction of the given kind.
    ///
    /// Reacting with the kind the user already has removes it; reacting
    /// with a different kind replaces the old one. A user holds at most
    /// one reaction per message.
    pub fn toggle(&mut self, user: &UserId, kind: &str) {
        let previous = self.kind_for_user(user).map(str::to_owned);

        if let Some(old_kind) = &previous {
            self.remove_user(user, old_kind);
            if old_kind == kind {
                // Same kind twice is a removal
                return;
            }
        }

        let group = self
            .by_kind
            .entry(kind.to_owned())
            .or_insert_with(|| ReactionGroup {
                kind: kind.to_owned(),
                count: 0,
                users: Vec::new(),
            });
        if !group.users.contains(user) {
            group.users.push(user.clone());
        }
        group.count = group.users.len();
    }

    fn remove_user(&mut self, user: &UserId, kind: &str) {
        if let Some(group) = self.by_kind.get_mut(kind) {
            group.users.retain(|u| u != user);
            group.count = group.users.len();
            if group.users.is_empty() {
                self.by_kind.remove(kind);
            }
        }
    }

    /// Rebuild a summary from raw groups, deduplicating users and
    /// recomputing counts. The user set is authoritative over whatever
    /// count the server sent.
    pub fn normalized(groups: Vec<ReactionGroup>) -> Self {
        let mut by_kind: HashMap<String, ReactionGroup> = HashMap::new();
        for group in groups {
            let entry = by_kind
                .entry(group.kind.clone())
                .or_insert_with(|| ReactionGroup {
                    kind: group.kind.clone(),
                    count: 0,
                    users: Vec::new(),
                });
            for user in group.users {
                if !entry.users.contains(&user) {
                    entry.users.push(user);
                }
            }
            entry.count = entry.users.len();
        }
        by_kind.retain(|_, g| !g.users.is_empty());
        Self { by_kind }
    }
}

/// Canonical message record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Current identity: server id once confirmed, temp id before that
    pub id: MessageId,

    /// Server id, absent while the message is optimistic
    pub server_id: Option<MessageId>,

    /// Correlation token for matching a server echo to this record
    pub correlation: Option<String>,

    pub conversation_id: ConversationId,
    pub kind: MessageKind,
    pub sender_id: UserId,
    pub sender_name: String,

    /// Opaque content; may contain structured markers the UI interprets
    pub content: String,

    pub attachments: Vec<Attachment>,
    pub reply_to: Option<ReplySnapshot>,
    pub forwarded_from: Option<ForwardInfo>,
    pub reactions: ReactionSummary,

    pub status: DeliveryStatus,
    pub delivered_to: Vec<Receipt>,
    pub read_by: Vec<Receipt>,

    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,

    /// Soft-delete flag. With an empty `deleted_for` this means deleted
    /// for everyone; otherwise deleted only for the listed viewers.
    pub is_deleted: bool,
    pub deleted_for: Vec<UserId>,

    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build an optimistic local record for an outbound send.
    #[allow(clippy::too_many_arguments)]
    pub fn optimistic(
        temp_id: MessageId,
        correlation: String,
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_name: String,
        kind: MessageKind,
        content: String,
        attachments: Vec<Attachment>,
        reply_to: Option<ReplySnapshot>,
        forwarded_from: Option<ForwardInfo>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: temp_id,
            server_id: None,
            correlation: Some(correlation),
            conversation_id,
            kind,
            sender_id,
            sender_name,
            content,
            attachments,
            reply_to,
            forwarded_from,
            reactions: ReactionSummary::default(),
            status: DeliveryStatus::Sending,
            delivered_to: Vec::new(),
            read_by: Vec::new(),
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_for: Vec::new(),
            created_at,
        }
    }

    /// Whether this record is still awaiting server confirmation.
    pub fn is_optimistic(&self) -> bool {
        self.server_id.is_none()
    }

    /// Visibility under soft-delete semantics: an empty `deleted_for`
    /// hides the message for everyone, otherwise only for its members.
    pub fn visible_to(&self, viewer: &UserId) -> bool {
        if !self.is_deleted {
            return true;
        }
        if self.deleted_for.is_empty() {
            return false;
        }
        !self.deleted_for.contains(viewer)
    }

    /// Advance the delivery status if the transition is legal; illegal
    /// transitions (regressions, failed-from-confirmed) are ignored.
    pub fn advance_status(&mut self, next: DeliveryStatus) -> bool {
        if self.status == next {
            return false;
        }
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Record a read receipt and advance status best-effort.
    pub fn mark_read_by(&mut self, viewer: UserId, at: DateTime<Utc>) {
        if !self.read_by.iter().any(|r| r.user_id == viewer) {
            self.read_by.push(Receipt {
                user_id: viewer,
                at,
            });
        }
        self.advance_status(DeliveryStatus::Read);
    }

    /// Record a delivery receipt and advance status best-effort.
    pub fn mark_delivered_to(&mut self, viewer: UserId, at: DateTime<Utc>) {
        if !self.delivered_to.iter().any(|r| r.user_id == viewer) {
            self.delivered_to.push(Receipt {
                user_id: viewer,
                at,
            });
        }
        self.advance_status(DeliveryStatus::Delivered);
    }

    /// Short preview used for conversation list summaries.
    pub fn preview(&self) -> String {
        const PREVIEW_LEN: usize = 80;
        match self.kind {
            MessageKind::Text | MessageKind::System => {
                self.content.chars().take(PREVIEW_LEN).collect()
            }
            MessageKind::Image => "[image]".to_owned(),
            MessageKind::Audio => "[audio]".to_owned(),
            MessageKind::Document => "[document]".to_owned(),
            MessageKind::Location => "[location]".to_owned(),
            MessageKind::Contact => "[contact]".to_owned(),
        }
    }
}

/// Fully-populated server-confirmed message for tests.
#[cfg(test)]
pub(crate) fn test_message(id: &str) -> Message {
    Message {
        id: id.to_string(),
        server_id: Some(id.to_string()),
        correlation: None,
        conversation_id: "c1".to_string(),
        kind: MessageKind::Text,
        sender_id: "u1".to_string(),
        sender_name: "User One".to_string(),
        content: "Test message".to_string(),
        attachments: vec![],
        reply_to: None,
        forwarded_from: None,
        reactions: ReactionSummary::default(),
        status: DeliveryStatus::Sent,
        delivered_to: vec![],
        read_by: vec![],
        is_edited: false,
        edited_at: None,
        is_deleted: false,
        deleted_for: vec![],
        created_at: Utc::now(),
    }
}
