//! WebSocket event listener.
//!
//! Connects to the backend's push endpoint, parses `{event, data}`
//! frames into [`ChatEvent`]s, and forwards them to the core's event
//! loop. Reconnects with capped exponential backoff; on every
//! successful (re)connect it rejoins the rooms the client was in and
//! emits `ConnectionUp`, on loss it emits `ConnectionDown`.

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::identity::IdentityProvider;
use crate::nabo::conversation::ConversationKind;
use crate::nabo::message::{ReactionGroup, ReactionSummary};
use crate::transport::wire::{WireMessage, WireReaction};
use crate::transport::{ChatEvent, ConnectivityFlag, ConversationPatch};
use crate::types::{ConversationId, RetryInfo, UserId};

/// Client frames sent upstream over the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Join {
        kind: ConversationKind,
        conversation_id: ConversationId,
    },
    Leave {
        kind: ConversationKind,
        conversation_id: ConversationId,
    },
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
}

impl ClientFrame {
    fn event_name(&self) -> &'static str {
        match self {
            ClientFrame::Join {
                kind: ConversationKind::Group,
                ..
            } => "join_group",
            ClientFrame::Join {
                kind: ConversationKind::Private,
                ..
            } => "join_chat",
            ClientFrame::Leave {
                kind: ConversationKind::Group,
                ..
            } => "leave_group",
            ClientFrame::Leave {
                kind: ConversationKind::Private,
                ..
            } => "leave_chat",
            ClientFrame::TypingStart { .. } => "typing_start",
            ClientFrame::TypingStop { .. } => "typing_stop",
        }
    }

    fn to_text(&self, user_id: &UserId, user_name: &str) -> String {
        let data = match self {
            ClientFrame::Join {
                conversation_id, ..
            }
            | ClientFrame::Leave {
                conversation_id, ..
            } => serde_json::json!({ "chatId": conversation_id }),
            ClientFrame::TypingStart { conversation_id } => serde_json::json!({
                "chatId": conversation_id,
                "userId": user_id,
                "userName": user_name,
            }),
            ClientFrame::TypingStop { conversation_id } => serde_json::json!({
                "chatId": conversation_id,
                "userId": user_id,
            }),
        };
        serde_json::json!({ "event": self.event_name(), "data": data }).to_string()
    }
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletePayload {
    #[serde(alias = "_id", alias = "id")]
    message_id: String,
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    deleted_for: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadPayload {
    chat_id: String,
    #[serde(default)]
    message_ids: Vec<String>,
    #[serde(alias = "readerId")]
    user_id: String,
    #[serde(default)]
    read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReactionPayload {
    message_id: String,
    #[serde(default)]
    reactions: Vec<WireReaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    chat_id: String,
    user_id: String,
    #[serde(default)]
    user_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresencePayload {
    user_id: String,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipPayload {
    chat_id: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatUpdatedPayload {
    #[serde(alias = "_id", alias = "id")]
    chat_id: String,
    #[serde(flatten)]
    patch: ConversationPatch,
}

/// Parse one server frame into a typed event. Unknown event names are
/// skipped with a debug log.
pub fn parse_frame(text: &str) -> Option<ChatEvent> {
    let frame: WireFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(target: "nabo::transport::ws", "Unparseable frame: {}", e);
            return None;
        }
    };

    let event = frame.event.as_str();
    let data = frame.data;

    fn payload<T: serde::de::DeserializeOwned>(event: &str, data: serde_json::Value) -> Option<T> {
        match serde_json::from_value(data) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::debug!(
                    target: "nabo::transport::ws",
                    "Malformed payload for {}: {}",
                    event,
                    e
                );
                None
            }
        }
    }

    match event {
        "new_message" | "message_received" => {
            let wire: WireMessage = payload(event, data)?;
            Some(ChatEvent::MessageReceived(wire.into_message()))
        }
        "message_updated" => {
            let wire: WireMessage = payload(event, data)?;
            Some(ChatEvent::MessageUpdated(wire.into_message()))
        }
        "message_deleted" => {
            let p: DeletePayload = payload(event, data)?;
            Some(ChatEvent::MessageDeleted {
                conversation_id: p.chat_id,
                message_id: p.message_id,
                deleted_for: p.deleted_for,
            })
        }
        "message_read" => {
            let p: ReadPayload = payload(event, data)?;
            Some(ChatEvent::MessageRead {
                conversation_id: p.chat_id,
                message_ids: p.message_ids,
                reader_id: p.user_id,
                read_at: p.read_at.unwrap_or_else(Utc::now),
            })
        }
        "message_reaction_updated" | "reaction_updated" => {
            let p: ReactionPayload = payload(event, data)?;
            let reactions = ReactionSummary::normalized(
                p.reactions
                    .into_iter()
                    .map(|r| ReactionGroup {
                        kind: r.kind,
                        count: r.count,
                        users: r.users,
                    })
                    .collect(),
            );
            Some(ChatEvent::ReactionUpdated {
                message_id: p.message_id,
                reactions,
            })
        }
        "user_typing" => {
            let p: TypingPayload = payload(event, data)?;
            Some(ChatEvent::TypingStarted {
                conversation_id: p.chat_id,
                user_id: p.user_id,
                user_name: p.user_name,
            })
        }
        "user_stopped_typing" => {
            let p: TypingPayload = payload(event, data)?;
            Some(ChatEvent::TypingStopped {
                conversation_id: p.chat_id,
                user_id: p.user_id,
            })
        }
        "user_online" => {
            let p: PresencePayload = payload(event, data)?;
            Some(ChatEvent::PresenceOnline { user_id: p.user_id })
        }
        "user_offline" => {
            let p: PresencePayload = payload(event, data)?;
            Some(ChatEvent::PresenceOffline {
                user_id: p.user_id,
                last_seen: p.last_seen,
            })
        }
        "chat_updated" => {
            let p: ChatUpdatedPayload = payload(event, data)?;
            Some(ChatEvent::ConversationUpdated {
                conversation_id: p.chat_id,
                patch: p.patch,
            })
        }
        "user_joined" => {
            let p: MembershipPayload = payload(event, data)?;
            Some(ChatEvent::MemberJoined {
                conversation_id: p.chat_id,
                user_id: p.user_id,
            })
        }
        "user_left" => {
            let p: MembershipPayload = payload(event, data)?;
            Some(ChatEvent::MemberLeft {
                conversation_id: p.chat_id,
                user_id: p.user_id,
            })
        }
        other => {
            tracing::debug!(target: "nabo::transport::ws", "Ignoring event: {}", other);
            None
        }
    }
}

pub struct EventSocket {
    ws_url: String,
    identity: Arc<dyn IdentityProvider>,
    events: mpsc::Sender<ChatEvent>,
    connectivity: ConnectivityFlag,
}

impl EventSocket {
    pub fn new(
        ws_url: impl Into<String>,
        identity: Arc<dyn IdentityProvider>,
        events: mpsc::Sender<ChatEvent>,
        connectivity: ConnectivityFlag,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            identity,
            events,
            connectivity,
        }
    }

    fn connect_url(&self) -> String {
        match self.identity.auth_token() {
            Some(token) => format!("{}?token={}", self.ws_url, token),
            None => self.ws_url.clone(),
        }
    }

    /// Run until `shutdown` fires. Reconnects forever with capped
    /// exponential backoff; `commands` carries client frames (joins,
    /// typing) which also maintain the room set used for rejoin.
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<ClientFrame>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        let user_id = self.identity.user_id();
        let user_name = self.identity.display_name();
        let mut rooms: HashSet<(ConversationKind, ConversationId)> = HashSet::new();
        let mut retry = RetryInfo::new(u32::MAX);

        loop {
            match connect_async(&self.connect_url()).await {
                Ok((stream, _response)) => {
                    retry = RetryInfo::new(u32::MAX);
                    self.connectivity.set(true);
                    tracing::debug!(target: "nabo::transport::ws", "Connected");

                    let (mut write, mut read) = stream.split();

                    // Rejoin rooms before announcing the connection so
                    // resync pulls observe a subscribed socket.
                    for (kind, conversation_id) in &rooms {
                        let frame = ClientFrame::Join {
                            kind: *kind,
                            conversation_id: conversation_id.clone(),
                        };
                        if write
                            .send(WsMessage::Text(frame.to_text(&user_id, &user_name)))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }

                    if self.events.send(ChatEvent::ConnectionUp).await.is_err() {
                        return;
                    }

                    loop {
                        tokio::select! {
                            incoming = read.next() => {
                                match incoming {
                                    Some(Ok(WsMessage::Text(text))) => {
                                        if let Some(event) = parse_frame(&text) {
                                            if self.events.send(event).await.is_err() {
                                                return;
                                            }
                                        }
                                    }
                                    Some(Ok(WsMessage::Close(_))) | None => break,
                                    Some(Err(e)) => {
                                        tracing::debug!(
                                            target: "nabo::transport::ws",
                                            "Socket error: {}",
                                            e
                                        );
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                }
                            }
                            command = commands.recv() => {
                                let Some(frame) = command else { return; };
                                Self::track_room(&mut rooms, &frame);
                                if write
                                    .send(WsMessage::Text(frame.to_text(&user_id, &user_name)))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            _ = shutdown.recv() => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                return;
                            }
                        }
                    }

                    self.connectivity.set(false);
                    if self.events.send(ChatEvent::ConnectionDown).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    self.connectivity.set(false);
                    tracing::debug!(
                        target: "nabo::transport::ws",
                        "Connect failed (attempt {}): {}",
                        retry.attempt,
                        e
                    );
                }
            }

            let delay = retry.delay_with_jitter();
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(next) = retry.next_attempt() {
                retry = next;
            }

            // Drain queued room changes while disconnected so the
            // rejoin set stays accurate.
            while let Ok(frame) = commands.try_recv() {
                Self::track_room(&mut rooms, &frame);
            }
        }
    }

    fn track_room(
        rooms: &mut HashSet<(ConversationKind, ConversationId)>,
        frame: &ClientFrame,
    ) {
        match frame {
            ClientFrame::Join {
                kind,
                conversation_id,
            } => {
                rooms.insert((*kind, conversation_id.clone()));
            }
            ClientFrame::Leave {
                kind,
                conversation_id,
            } => {
                rooms.remove(&(*kind, conversation_id.clone()));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nabo::message::DeliveryStatus;

    #[test]
    fn test_parse_new_message_frame() {
        let text = r#"{
            "event": "new_message",
            "data": {
                "_id": "m9",
                "chatId": "c1",
                "senderId": "u2",
                "content": "hey",
                "timestamp": "2024-01-01T12:00:00Z"
            }
        }"#;

        let Some(ChatEvent::MessageReceived(message)) = parse_frame(text) else {
            panic!("expected MessageReceived");
        };
        assert_eq!(message.id, "m9");
        assert_eq!(message.conversation_id, "c1");
        assert_eq!(message.status, DeliveryStatus::Sent);
    }

    #[test]
    fn test_message_received_alias() {
        let text = r#"{
            "event": "message_received",
            "data": {
                "id": "m9", "chatId": "c1", "senderId": "u2",
                "content": "hey", "createdAt": "2024-01-01T12:00:00Z",
                "correlationId": "k1"
            }
        }"#;

        let Some(ChatEvent::MessageReceived(message)) = parse_frame(text) else {
            panic!("expected MessageReceived");
        };
        assert_eq!(message.correlation.as_deref(), Some("k1"));
    }

    #[test]
    fn test_parse_delete_for_everyone() {
        let text = r#"{
            "event": "message_deleted",
            "data": { "messageId": "m7", "chatId": "c1", "deletedFor": [] }
        }"#;

        let Some(ChatEvent::MessageDeleted { deleted_for, message_id, .. }) = parse_frame(text)
        else {
            panic!("expected MessageDeleted");
        };
        assert_eq!(message_id, "m7");
        assert!(deleted_for.is_empty());
    }

    #[test]
    fn test_parse_typing_events() {
        let started = r#"{
            "event": "user_typing",
            "data": { "chatId": "c1", "userId": "u3", "userName": "Carol" }
        }"#;
        let stopped = r#"{
            "event": "user_stopped_typing",
            "data": { "chatId": "c1", "userId": "u3" }
        }"#;

        assert!(matches!(
            parse_frame(started),
            Some(ChatEvent::TypingStarted { .. })
        ));
        assert!(matches!(
            parse_frame(stopped),
            Some(ChatEvent::TypingStopped { .. })
        ));
    }

    #[test]
    fn test_parse_reaction_update_normalizes() {
        let text = r#"{
            "event": "reaction_updated",
            "data": {
                "messageId": "m1",
                "reactions": [{"kind": "like", "count": 9, "users": ["u1", "u1"]}]
            }
        }"#;

        let Some(ChatEvent::ReactionUpdated { reactions, .. }) = parse_frame(text) else {
            panic!("expected ReactionUpdated");
        };
        assert_eq!(reactions.by_kind["like"].count, 1);
    }

    #[test]
    fn test_parse_chat_updated_patch() {
        let text = r#"{
            "event": "chat_updated",
            "data": { "chatId": "c1", "name": "New name", "isPinned": true }
        }"#;

        let Some(ChatEvent::ConversationUpdated { conversation_id, patch }) = parse_frame(text)
        else {
            panic!("expected ConversationUpdated");
        };
        assert_eq!(conversation_id, "c1");
        assert_eq!(patch.name.as_deref(), Some("New name"));
        assert_eq!(patch.is_pinned, Some(true));
    }

    #[test]
    fn test_unknown_event_is_skipped() {
        assert!(parse_frame(r#"{"event": "heartbeat", "data": {}}"#).is_none());
        assert!(parse_frame("not json").is_none());
    }

    #[test]
    fn test_client_frame_names() {
        let join = ClientFrame::Join {
            kind: ConversationKind::Group,
            conversation_id: "c1".to_string(),
        };
        let text = join.to_text(&"u1".to_string(), "Alice");
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "join_group");
        assert_eq!(value["data"]["chatId"], "c1");

        let typing = ClientFrame::TypingStart {
            conversation_id: "c1".to_string(),
        };
        let text = typing.to_text(&"u1".to_string(), "Alice");
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "typing_start");
        assert_eq!(value["data"]["userName"], "Alice");
    }
}
