//! Transport adapter.
//!
//! Two surfaces: request/response operations against the REST API
//! ([`HttpTransport`]) and a typed event stream fed by the WebSocket
//! listener ([`ws::EventSocket`]). Wire-shape normalization happens in
//! [`wire`]; everything past this module speaks the canonical model.

pub mod http;
pub mod wire;
pub mod ws;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::nabo::conversation::{Conversation, ConversationKind};
use crate::nabo::message::{Attachment, Message, MessageKind, ReactionSummary};
use crate::types::{ConversationId, MessageId, UserId};

pub use http::HttpTransport;

/// Failure classification driving retry and surfacing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failure, timeout, 408, 429, 5xx. Retried with backoff.
    Transient,
    /// 401 or expired token. Never retried; ends the session.
    Auth,
    /// 403. Surfaced, never retried.
    Permission,
    /// 404 or 410 on a known resource. Surfaced; stale local records
    /// get dropped by the caller.
    NotFound,
    /// Structured 4xx rejection. Surfaced with detail, never retried.
    Validation,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct TransportError {
    pub class: ErrorClass,
    /// Operation label for logs, e.g. "send_message".
    pub operation: &'static str,
    /// Correlation token of the outbound send this error belongs to.
    pub correlation_id: Option<String>,
    pub message: String,
}

impl TransportError {
    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            operation,
            correlation_id: None,
            message: message.into(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn retryable(&self) -> bool {
        self.class == ErrorClass::Transient
    }

    /// Map an HTTP status to an error class.
    pub fn from_status(operation: &'static str, status: u16, body: String) -> Self {
        let class = match status {
            401 => ErrorClass::Auth,
            403 => ErrorClass::Permission,
            404 | 410 => ErrorClass::NotFound,
            408 | 429 => ErrorClass::Transient,
            s if s >= 500 => ErrorClass::Transient,
            _ => ErrorClass::Validation,
        };
        Self {
            class,
            operation,
            correlation_id: None,
            message: if body.is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {body}")
            },
        }
    }
}

/// What a caller wants to send. Everything needed to build both the
/// optimistic record and the REST body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageDraft {
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
    /// Set when the draft is a forward of an existing message.
    #[serde(default)]
    pub forwarded_from: Option<crate::nabo::message::ForwardInfo>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            content: content.into(),
            attachments: Vec::new(),
            reply_to_id: None,
            forwarded_from: None,
        }
    }
}

/// Scope of a soft delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    /// Hidden for every participant.
    Everyone,
    /// Hidden for the requesting user only.
    Me,
}

/// Cursor query for a message page.
#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    pub before: Option<MessageId>,
    pub after: Option<MessageId>,
    pub limit: usize,
}

impl PageQuery {
    pub fn tail(limit: usize) -> Self {
        Self {
            before: None,
            after: None,
            limit,
        }
    }

    pub fn before(cursor: MessageId, limit: usize) -> Self {
        Self {
            before: Some(cursor),
            after: None,
            limit,
        }
    }

    pub fn after(cursor: MessageId, limit: usize) -> Self {
        Self {
            before: None,
            after: Some(cursor),
            limit,
        }
    }
}

/// One page of messages, oldest first.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub messages: Vec<Message>,
    pub has_more_before: bool,
}

/// Partial conversation update carried by `chat_updated` events.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub member_count: Option<usize>,
    #[serde(default)]
    pub is_muted: Option<bool>,
    #[serde(default)]
    pub is_archived: Option<bool>,
    #[serde(default)]
    pub is_pinned: Option<bool>,
}

/// Settings mutation pushed to the server.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_archived: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
}

/// Typed events from the push stream, already normalized.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    MessageReceived(Message),
    MessageUpdated(Message),
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
        /// Empty means deleted for everyone.
        deleted_for: Vec<UserId>,
    },
    MessageRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },
    ReactionUpdated {
        message_id: MessageId,
        reactions: ReactionSummary,
    },
    TypingStarted {
        conversation_id: ConversationId,
        user_id: UserId,
        user_name: String,
    },
    TypingStopped {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    PresenceOnline {
        user_id: UserId,
    },
    PresenceOffline {
        user_id: UserId,
        last_seen: Option<DateTime<Utc>>,
    },
    ConversationUpdated {
        conversation_id: ConversationId,
        patch: ConversationPatch,
    },
    MemberJoined {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    MemberLeft {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    ConnectionUp,
    ConnectionDown,
}

/// Request/response surface of the backend.
///
/// Implementations classify failures; retry policy lives with the
/// caller (the outbound pipeline), never here.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn list_conversations(
        &self,
        kind: ConversationKind,
    ) -> Result<Vec<Conversation>, TransportError>;

    async fn list_messages(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
        query: PageQuery,
    ) -> Result<Page, TransportError>;

    async fn send_message(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
        draft: &MessageDraft,
        correlation_id: &str,
    ) -> Result<Message, TransportError>;

    async fn edit_message(
        &self,
        message_id: &MessageId,
        content: &str,
    ) -> Result<Message, TransportError>;

    async fn soft_delete_message(
        &self,
        message_id: &MessageId,
        scope: DeleteScope,
    ) -> Result<(), TransportError>;

    async fn react(
        &self,
        message_id: &MessageId,
        reaction_kind: &str,
    ) -> Result<ReactionSummary, TransportError>;

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
        read_at: DateTime<Utc>,
    ) -> Result<(), TransportError>;

    async fn create_group(
        &self,
        name: &str,
        member_ids: &[UserId],
    ) -> Result<Conversation, TransportError>;

    async fn create_private(&self, peer_id: &UserId) -> Result<Conversation, TransportError>;

    async fn update_conversation_settings(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
        settings: ConversationSettings,
    ) -> Result<(), TransportError>;

    async fn delete_conversation(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
    ) -> Result<(), TransportError>;

    /// Current connectivity as reported by the event socket.
    fn is_connected(&self) -> bool;
}

/// Shared connectivity flag between the socket task and the transport.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityFlag(Arc<AtomicBool>);

impl ConnectivityFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, connected: bool) {
        self.0.store(connected, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
