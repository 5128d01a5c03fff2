//! REST side of the transport.
//!
//! Thin, classification-only client: every failure is mapped onto an
//! [`ErrorClass`] and returned; retry decisions belong to the outbound
//! pipeline. Endpoints are grouped per conversation kind, mirroring the
//! backend's `/api/chat/groups` and `/api/chat/private` split.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::identity::IdentityProvider;
use crate::nabo::conversation::{Conversation, ConversationKind};
use crate::nabo::message::{Message, ReactionGroup, ReactionSummary};
use crate::transport::wire::{
    kind_str, MarkReadBody, PatchMessageBody, SendMessageBody, WireAttachment, WireConversation,
    WireForwardedFrom, WireMessage, WireReaction,
};
use crate::transport::{
    ConnectivityFlag, DeleteScope, ErrorClass, MessageDraft, Page, PageQuery, TransportError,
};
use crate::types::{ConversationId, MessageId, UserId};

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(20);

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    identity: Arc<dyn IdentityProvider>,
    /// Shared with the event socket; reflects the push stream's state.
    connectivity: ConnectivityFlag,
}

fn kind_segment(kind: ConversationKind) -> &'static str {
    match kind {
        ConversationKind::Group => "groups",
        ConversationKind::Private => "private",
    }
}

fn network_error(operation: &'static str, error: reqwest::Error) -> TransportError {
    // Anything that failed before a status arrived is a network-level
    // problem: connect, timeout, reset.
    TransportError::transient(operation, error.to_string())
}

/// Message pages arrive either wrapped or as a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PageBody {
    Wrapped(PageEnvelope),
    Bare(Vec<WireMessage>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageEnvelope {
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default, alias = "hasMore")]
    has_more_before: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReactionEnvelope {
    #[serde(default)]
    reactions: Vec<WireReaction>,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| network_error("client_init", e))?;
        let connectivity = ConnectivityFlag::new();
        // Assume reachability until the socket reports otherwise.
        connectivity.set(true);
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            identity,
            connectivity,
        })
    }

    /// Share a connectivity flag with the event socket.
    pub fn with_connectivity(mut self, connectivity: ConnectivityFlag) -> Self {
        self.connectivity = connectivity;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.identity.auth_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::from_status(operation, status.as_u16(), body))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, TransportError> {
        let request = self
            .authorize(self.client.get(self.url(path)))
            .query(query);
        let response = request
            .send()
            .await
            .map_err(|e| network_error(operation, e))?;
        Self::check(operation, response)
            .await?
            .json::<T>()
            .await
            .map_err(|e| TransportError {
                class: ErrorClass::Validation,
                operation,
                correlation_id: None,
                message: format!("malformed response body: {e}"),
            })
    }

    async fn send_body(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self
            .authorize(request)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await
            .map_err(|e| network_error(operation, e))?;
        Self::check(operation, response).await
    }
}

#[async_trait::async_trait]
impl super::Transport for HttpTransport {
    async fn list_conversations(
        &self,
        kind: ConversationKind,
    ) -> Result<Vec<Conversation>, TransportError> {
        let path = format!("/api/chat/{}", kind_segment(kind));
        let wire: Vec<WireConversation> = self
            .get_json("list_conversations", &path, &[])
            .await?;
        Ok(wire
            .into_iter()
            .map(|c| c.into_conversation(kind))
            .collect())
    }

    async fn list_messages(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
        query: PageQuery,
    ) -> Result<Page, TransportError> {
        let path = format!(
            "/api/chat/{}/{}/messages",
            kind_segment(kind),
            conversation_id
        );
        let mut params: Vec<(&str, String)> = vec![("limit", query.limit.to_string())];
        if let Some(before) = &query.before {
            params.push(("before", before.clone()));
        }
        if let Some(after) = &query.after {
            params.push(("after", after.clone()));
        }

        let body: PageBody = self.get_json("list_messages", &path, &params).await?;
        let (wire_messages, has_more_before) = match body {
            PageBody::Wrapped(envelope) => (envelope.messages, envelope.has_more_before),
            // Bare arrays carry no marker; a full page implies more.
            PageBody::Bare(messages) => {
                let full = query.limit > 0 && messages.len() >= query.limit;
                (messages, full)
            }
        };
        let mut messages: Vec<Message> = wire_messages
            .into_iter()
            .map(WireMessage::into_message)
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(Page {
            messages,
            has_more_before,
        })
    }

    async fn send_message(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
        draft: &MessageDraft,
        correlation_id: &str,
    ) -> Result<Message, TransportError> {
        let path = format!(
            "/api/chat/{}/{}/messages",
            kind_segment(kind),
            conversation_id
        );
        let body = SendMessageBody {
            content: draft.content.clone(),
            kind: kind_str(draft.kind).to_string(),
            attachments: draft
                .attachments
                .iter()
                .map(WireAttachment::from_attachment)
                .collect(),
            reply_to_id: draft.reply_to_id.clone(),
            forwarded_from: draft
                .forwarded_from
                .as_ref()
                .map(WireForwardedFrom::from_forward_info),
            correlation_id: correlation_id.to_string(),
        };

        let response = self
            .send_body(
                "send_message",
                self.client.post(self.url(&path)).json(&body),
            )
            .await
            .map_err(|e| e.with_correlation(correlation_id))?;
        let wire: WireMessage = response.json().await.map_err(|e| {
            TransportError {
                class: ErrorClass::Validation,
                operation: "send_message",
                correlation_id: Some(correlation_id.to_string()),
                message: format!("malformed response body: {e}"),
            }
        })?;
        Ok(wire.into_message())
    }

    async fn edit_message(
        &self,
        message_id: &MessageId,
        content: &str,
    ) -> Result<Message, TransportError> {
        let path = format!("/api/messages/{message_id}");
        let body = PatchMessageBody {
            content: Some(content.to_string()),
            is_deleted: None,
            deleted_for: None,
        };
        let response = self
            .send_body("edit_message", self.client.patch(self.url(&path)).json(&body))
            .await?;
        let wire: WireMessage = response.json().await.map_err(|e| TransportError {
            class: ErrorClass::Validation,
            operation: "edit_message",
            correlation_id: None,
            message: format!("malformed response body: {e}"),
        })?;
        Ok(wire.into_message())
    }

    async fn soft_delete_message(
        &self,
        message_id: &MessageId,
        scope: DeleteScope,
    ) -> Result<(), TransportError> {
        let path = format!("/api/messages/{message_id}");
        let deleted_for = match scope {
            DeleteScope::Everyone => Vec::new(),
            DeleteScope::Me => vec![self.identity.user_id()],
        };
        let body = PatchMessageBody {
            content: None,
            is_deleted: Some(true),
            deleted_for: Some(deleted_for),
        };
        self.send_body(
            "soft_delete_message",
            self.client.patch(self.url(&path)).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn react(
        &self,
        message_id: &MessageId,
        reaction_kind: &str,
    ) -> Result<ReactionSummary, TransportError> {
        let path = format!("/api/messages/{message_id}/react");
        let body = serde_json::json!({ "reactionKind": reaction_kind });
        let response = self
            .send_body("react", self.client.post(self.url(&path)).json(&body))
            .await?;
        let envelope: ReactionEnvelope = response.json().await.map_err(|e| TransportError {
            class: ErrorClass::Validation,
            operation: "react",
            correlation_id: None,
            message: format!("malformed response body: {e}"),
        })?;
        Ok(ReactionSummary::normalized(
            envelope
                .reactions
                .into_iter()
                .map(|r| ReactionGroup {
                    kind: r.kind,
                    count: r.count,
                    users: r.users,
                })
                .collect(),
        ))
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
        read_at: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        let path = format!("/api/chats/{conversation_id}/read");
        let body = MarkReadBody {
            message_ids: message_ids.to_vec(),
            read_at,
        };
        self.send_body("mark_read", self.client.post(self.url(&path)).json(&body))
            .await?;
        Ok(())
    }

    async fn create_group(
        &self,
        name: &str,
        member_ids: &[UserId],
    ) -> Result<Conversation, TransportError> {
        let body = serde_json::json!({ "name": name, "memberIds": member_ids });
        let response = self
            .send_body(
                "create_group",
                self.client.post(self.url("/api/chat/groups")).json(&body),
            )
            .await?;
        let wire: WireConversation = response.json().await.map_err(|e| TransportError {
            class: ErrorClass::Validation,
            operation: "create_group",
            correlation_id: None,
            message: format!("malformed response body: {e}"),
        })?;
        Ok(wire.into_conversation(ConversationKind::Group))
    }

    async fn create_private(&self, peer_id: &UserId) -> Result<Conversation, TransportError> {
        let body = serde_json::json!({ "participantId": peer_id });
        let response = self
            .send_body(
                "create_private",
                self.client.post(self.url("/api/chat/private")).json(&body),
            )
            .await?;
        let wire: WireConversation = response.json().await.map_err(|e| TransportError {
            class: ErrorClass::Validation,
            operation: "create_private",
            correlation_id: None,
            message: format!("malformed response body: {e}"),
        })?;
        Ok(wire.into_conversation(ConversationKind::Private))
    }

    async fn update_conversation_settings(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
        settings: super::ConversationSettings,
    ) -> Result<(), TransportError> {
        let path = format!("/api/chat/{}/{}", kind_segment(kind), conversation_id);
        self.send_body(
            "update_conversation_settings",
            self.client.patch(self.url(&path)).json(&settings),
        )
        .await?;
        Ok(())
    }

    async fn delete_conversation(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
    ) -> Result<(), TransportError> {
        let path = format!("/api/chat/{}/{}", kind_segment(kind), conversation_id);
        self.send_body("delete_conversation", self.client.delete(self.url(&path)))
            .await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connectivity.get()
    }
}
