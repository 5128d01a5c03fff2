//! Wire shapes for the chat backend.
//!
//! The server is loose about field names: records arrive with `id` or
//! `_id`, `createdAt` or `timestamp`, `type` or `messageType`,
//! `attachments` or `media`. Everything is normalized here, at the
//! transport boundary; the rest of the crate only sees the canonical
//! model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::nabo::conversation::{Conversation, ConversationKind, LastMessage, PeerInfo};
use crate::nabo::message::{
    Attachment, DeliveryStatus, ForwardInfo, Message, MessageKind, ReactionGroup,
    ReactionSummary, Receipt, ReplySnapshot,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(alias = "_id")]
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", alias = "messageType", default)]
    pub kind: Option<String>,
    #[serde(alias = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub delivered_to: Vec<WireReceipt>,
    #[serde(default)]
    pub read_by: Vec<WireReceipt>,
    #[serde(default)]
    pub reactions: Vec<WireReaction>,
    #[serde(default)]
    pub reply_to: Option<WireReplyTo>,
    #[serde(default, alias = "media")]
    pub attachments: Vec<WireAttachment>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_for: Vec<String>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_forwarded: bool,
    #[serde(default)]
    pub forwarded_from: Option<WireForwardedFrom>,
    /// Client correlation token echoed back on sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireReceipt {
    pub user_id: String,
    #[serde(default, alias = "readAt", alias = "deliveredAt")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireReaction {
    #[serde(alias = "emoji", alias = "type")]
    pub kind: String,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireReplyTo {
    #[serde(alias = "id")]
    pub message_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireForwardedFrom {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub forwarded_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAttachment {
    #[serde(default, alias = "_id")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(alias = "uri")]
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireConversation {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub member_count: Option<usize>,
    #[serde(default)]
    pub participant: Option<WireParticipant>,
    #[serde(default)]
    pub last_message: Option<WireMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireParticipant {
    #[serde(alias = "_id")]
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Body of `POST .../messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<WireAttachment>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_to_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub forwarded_from: Option<WireForwardedFrom>,
    pub correlation_id: String,
}

/// Body of `PATCH /api/messages/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchMessageBody {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted_for: Option<Vec<String>>,
}

/// Body of `POST /api/chats/{id}/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadBody {
    pub message_ids: Vec<String>,
    pub read_at: DateTime<Utc>,
}

fn parse_kind(kind: Option<&str>) -> MessageKind {
    match kind {
        Some("image") => MessageKind::Image,
        Some("audio") => MessageKind::Audio,
        Some("document") => MessageKind::Document,
        Some("location") => MessageKind::Location,
        Some("contact") => MessageKind::Contact,
        Some("system") => MessageKind::System,
        _ => MessageKind::Text,
    }
}

pub(crate) fn kind_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::Audio => "audio",
        MessageKind::Document => "document",
        MessageKind::Location => "location",
        MessageKind::Contact => "contact",
        MessageKind::System => "system",
    }
}

fn parse_status(status: Option<&str>) -> DeliveryStatus {
    match status {
        Some("queued") => DeliveryStatus::Queued,
        Some("sending") => DeliveryStatus::Sending,
        Some("delivered") => DeliveryStatus::Delivered,
        Some("read") => DeliveryStatus::Read,
        Some("failed") => DeliveryStatus::Failed,
        // Server records without a status are at least sent.
        _ => DeliveryStatus::Sent,
    }
}

impl WireReceipt {
    fn into_receipt(self, fallback: DateTime<Utc>) -> Receipt {
        Receipt {
            user_id: self.user_id,
            at: self.timestamp.unwrap_or(fallback),
        }
    }
}

impl WireMessage {
    /// Normalize into the canonical message model.
    pub fn into_message(self) -> Message {
        let created_at = self.created_at;
        let reactions = ReactionSummary::normalized(
            self.reactions
                .into_iter()
                .map(|r| ReactionGroup {
                    kind: r.kind,
                    count: r.count,
                    users: r.users,
                })
                .collect(),
        );
        Message {
            id: self.id.clone(),
            server_id: Some(self.id),
            correlation: self.correlation_id,
            conversation_id: self.chat_id,
            kind: parse_kind(self.kind.as_deref()),
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            content: self.content,
            attachments: self
                .attachments
                .into_iter()
                .map(WireAttachment::into_attachment)
                .collect(),
            reply_to: self.reply_to.map(WireReplyTo::into_snapshot),
            forwarded_from: self.forwarded_from.map(WireForwardedFrom::into_forward_info),
            reactions,
            status: parse_status(self.status.as_deref()),
            delivered_to: self
                .delivered_to
                .into_iter()
                .map(|r| r.into_receipt(created_at))
                .collect(),
            read_by: self
                .read_by
                .into_iter()
                .map(|r| r.into_receipt(created_at))
                .collect(),
            is_edited: self.is_edited,
            edited_at: self.edited_at,
            is_deleted: self.is_deleted,
            deleted_for: self.deleted_for,
            created_at,
        }
    }
}

impl WireAttachment {
    fn into_attachment(self) -> Attachment {
        Attachment {
            id: self.id,
            kind: self.kind.unwrap_or_else(|| "file".to_string()),
            size: self.size.unwrap_or(0),
            uri: self.url,
            thumbnail_uri: self.thumbnail_url,
        }
    }

    pub fn from_attachment(attachment: &Attachment) -> Self {
        Self {
            id: attachment.id.clone(),
            kind: Some(attachment.kind.clone()),
            size: Some(attachment.size),
            url: attachment.uri.clone(),
            thumbnail_url: attachment.thumbnail_uri.clone(),
        }
    }
}

impl WireReplyTo {
    fn into_snapshot(self) -> ReplySnapshot {
        ReplySnapshot {
            message_id: self.message_id,
            content: self.content,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            kind: parse_kind(self.kind.as_deref()),
        }
    }
}

impl WireForwardedFrom {
    pub fn from_forward_info(info: &ForwardInfo) -> Self {
        Self {
            message_id: info.message_id.clone(),
            sender_id: info.sender_id.clone(),
            sender_name: info.sender_name.clone(),
            chat_id: info.conversation_id.clone(),
            forwarded_by: info.forwarded_by.clone(),
        }
    }

    fn into_forward_info(self) -> ForwardInfo {
        ForwardInfo {
            message_id: self.message_id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            conversation_id: self.chat_id,
            forwarded_by: self.forwarded_by,
        }
    }
}

impl WireConversation {
    pub fn into_conversation(self, kind: ConversationKind) -> Conversation {
        let peer_name = self.participant.as_ref().and_then(|p| p.name.clone());
        let peer = self.participant.map(|p| PeerInfo {
            user_id: p.user_id,
            online: p.is_online,
            last_seen: p.last_seen,
        });
        // Private conversations fall back to the peer's name.
        let name = self.name.or(peer_name).unwrap_or_default();
        Conversation {
            id: self.id,
            kind,
            name,
            description: self.description,
            member_count: self.member_count.unwrap_or(0),
            peer,
            last_message: self.last_message.map(|m| {
                let message = m.into_message();
                LastMessage::from_message(&message)
            }),
            unread: self.unread_count,
            muted: self.is_muted,
            archived: self.is_archived,
            pinned: self.is_pinned,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_accepts_canonical_fields() {
        let raw = json!({
            "id": "m1",
            "chatId": "c1",
            "senderId": "u1",
            "senderName": "Alice",
            "content": "hello",
            "type": "text",
            "createdAt": "2024-01-01T12:00:00Z",
            "status": "sent"
        });

        let message = serde_json::from_value::<WireMessage>(raw)
            .unwrap()
            .into_message();
        assert_eq!(message.id, "m1");
        assert_eq!(message.server_id.as_deref(), Some("m1"));
        assert_eq!(message.conversation_id, "c1");
        assert_eq!(message.status, DeliveryStatus::Sent);
    }

    #[test]
    fn test_message_accepts_legacy_aliases() {
        let raw = json!({
            "_id": "m2",
            "chatId": "c1",
            "senderId": "u1",
            "content": "hi",
            "messageType": "image",
            "timestamp": "2024-01-01T12:00:00Z",
            "media": [
                {"id": "a1", "type": "image", "url": "https://cdn/x.jpg"}
            ]
        });

        let message = serde_json::from_value::<WireMessage>(raw)
            .unwrap()
            .into_message();
        assert_eq!(message.id, "m2");
        assert_eq!(message.kind, MessageKind::Image);
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].uri, "https://cdn/x.jpg");
    }

    #[test]
    fn test_missing_status_defaults_to_sent() {
        let raw = json!({
            "id": "m3",
            "chatId": "c1",
            "senderId": "u1",
            "content": "x",
            "createdAt": "2024-01-01T12:00:00Z"
        });

        let message = serde_json::from_value::<WireMessage>(raw)
            .unwrap()
            .into_message();
        assert_eq!(message.status, DeliveryStatus::Sent);
        assert_eq!(message.kind, MessageKind::Text);
    }

    #[test]
    fn test_reactions_are_normalized_on_ingest() {
        let raw = json!({
            "id": "m4",
            "chatId": "c1",
            "senderId": "u1",
            "content": "x",
            "createdAt": "2024-01-01T12:00:00Z",
            "reactions": [
                {"kind": "like", "count": 7, "users": ["u1", "u1", "u2"]}
            ]
        });

        let message = serde_json::from_value::<WireMessage>(raw)
            .unwrap()
            .into_message();
        let group = &message.reactions.by_kind["like"];
        assert_eq!(group.count, 2);
    }

    #[test]
    fn test_reply_snapshot_survives_ingest() {
        let raw = json!({
            "id": "m5",
            "chatId": "c1",
            "senderId": "u2",
            "content": "replying",
            "createdAt": "2024-01-01T12:00:00Z",
            "replyTo": {
                "messageId": "m1",
                "content": "original",
                "senderId": "u1",
                "senderName": "Alice",
                "type": "text"
            }
        });

        let message = serde_json::from_value::<WireMessage>(raw)
            .unwrap()
            .into_message();
        let reply = message.reply_to.unwrap();
        assert_eq!(reply.message_id, "m1");
        assert_eq!(reply.content, "original");
    }

    #[test]
    fn test_conversation_accepts_underscore_id() {
        let raw = json!({
            "_id": "c7",
            "name": "Block watch",
            "memberCount": 12,
            "unreadCount": 3
        });

        let conversation = serde_json::from_value::<WireConversation>(raw)
            .unwrap()
            .into_conversation(ConversationKind::Group);
        assert_eq!(conversation.id, "c7");
        assert_eq!(conversation.member_count, 12);
        assert_eq!(conversation.unread, 3);
    }

    #[test]
    fn test_private_conversation_carries_peer() {
        let raw = json!({
            "id": "p1",
            "participant": {
                "userId": "u9",
                "name": "Bea",
                "isOnline": true
            }
        });

        let conversation = serde_json::from_value::<WireConversation>(raw)
            .unwrap()
            .into_conversation(ConversationKind::Private);
        let peer = conversation.peer.unwrap();
        assert_eq!(peer.user_id, "u9");
        assert!(peer.online);
    }

    #[test]
    fn test_send_body_serializes_camel_case() {
        let body = SendMessageBody {
            content: "hello".to_string(),
            kind: "text".to_string(),
            attachments: Vec::new(),
            reply_to_id: None,
            forwarded_from: None,
            correlation_id: "k1".to_string(),
        };

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["correlationId"], "k1");
        assert_eq!(value["type"], "text");
        assert!(value.get("replyToId").is_none());
        assert!(value.get("forwardedFrom").is_none());
    }
}
