//! Event merger.
//!
//! Applies pushed events to the registry, the store, the history cache
//! and the typing tracker, in arrival order. Server echoes of our own
//! sends are reconciled against the outbound queue by correlation
//! token; whichever confirmation arrives first (echo or REST reply)
//! wins, the loser only patches. Around a reconnect, live events are
//! buffered until the per-conversation tail re-pull finishes, so
//! resynced pages never race with fresher pushes.

use chrono::Utc;

use super::store::AppendOutcome;
use super::streams::UpdateTrigger;
use super::Nabo;
use crate::transport::{ChatEvent, PageQuery};

/// How far apart a server record and a queued draft may sit, in
/// seconds, for fallback content matching to pair them.
const CONTENT_MATCH_WINDOW_SECS: i64 = 5;

/// Reconnect bookkeeping. While a resync runs, live events queue up in
/// `buffered` and replay after the tail pulls complete.
#[derive(Debug, Default)]
pub(crate) struct ResyncState {
    pub active: bool,
    pub buffered: Vec<ChatEvent>,
}

impl Nabo {
    /// Entry point for everything the socket pushes.
    pub(crate) async fn apply_event(&self, event: ChatEvent) {
        match event {
            ChatEvent::ConnectionUp => self.handle_connection_up().await,
            ChatEvent::ConnectionDown => {
                let _ = self.connectivity_tx.send(false);
            }
            other => {
                {
                    let mut resync = self.resync.lock().await;
                    if resync.active {
                        resync.buffered.push(other);
                        return;
                    }
                }
                self.apply_event_inner(other).await;
            }
        }
    }

    /// Reconnect resync: re-pull the tail page of every conversation
    /// with cached history, replay events buffered meanwhile, then
    /// drain sends that queued up while offline.
    async fn handle_connection_up(&self) {
        let _ = self.connectivity_tx.send(true);
        self.resync.lock().await.active = true;

        let targets = self.history.lock().await.conversation_ids();
        tracing::debug!(
            target: "nabo::merger",
            "Reconnected; resyncing {} conversation(s)",
            targets.len()
        );
        for conversation_id in targets {
            let kind = self
                .registry
                .read()
                .await
                .get(&conversation_id)
                .map(|c| c.kind);
            let Some(kind) = kind else { continue };
            match self
                .transport
                .list_messages(kind, &conversation_id, PageQuery::tail(self.config.page_size))
                .await
            {
                Ok(page) => {
                    self.merge_tail_page(&conversation_id, page.messages, page.has_more_before)
                        .await;
                }
                Err(e) => {
                    tracing::debug!(
                        target: "nabo::merger",
                        "Resync pull for {} failed: {}",
                        conversation_id,
                        e
                    );
                }
            }
        }

        let buffered = {
            let mut resync = self.resync.lock().await;
            resync.active = false;
            std::mem::take(&mut resync.buffered)
        };
        for event in buffered {
            self.apply_event_inner(event).await;
        }

        let pending = self.queue.lock().await.conversations_with_pending();
        for conversation_id in pending {
            self.dispatch_conversation(&conversation_id).await;
        }
    }

    pub(crate) async fn apply_event_inner(&self, event: ChatEvent) {
        match event {
            ChatEvent::MessageReceived(message) => {
                self.merge_incoming_message(message).await;
            }
            ChatEvent::MessageUpdated(message) => {
                let conversation_id = message.conversation_id.clone();
                let known = {
                    let mut store = self.store.write().await;
                    // Patch only; an update for a message outside the
                    // cached window must not splice a lone record in.
                    if store.contains(&message.id) {
                        store.append(message.clone());
                        true
                    } else {
                        false
                    }
                };
                if known {
                    self.refresh_window_from_store(&conversation_id).await;
                    self.emit_thread(
                        &conversation_id,
                        UpdateTrigger::MessageUpdated,
                        Some(message),
                    );
                }
            }
            ChatEvent::MessageDeleted {
                conversation_id,
                message_id,
                deleted_for,
            } => {
                let known = {
                    let mut store = self.store.write().await;
                    if deleted_for.is_empty() {
                        // Deleted for everyone: the record is gone, not
                        // just hidden.
                        store.remove(&message_id).is_some()
                    } else {
                        store.patch(&message_id, |m| {
                            m.is_deleted = true;
                            for user in &deleted_for {
                                if !m.deleted_for.contains(user) {
                                    m.deleted_for.push(user.clone());
                                }
                            }
                        })
                    }
                };
                if known {
                    self.refresh_window_from_store(&conversation_id).await;
                    self.emit_thread(&conversation_id, UpdateTrigger::MessageDeleted, None);
                }
            }
            ChatEvent::MessageRead {
                conversation_id,
                message_ids,
                reader_id,
                read_at,
            } => {
                {
                    let mut store = self.store.write().await;
                    for message_id in &message_ids {
                        store.mark_read(message_id, reader_id.clone(), read_at);
                    }
                }
                self.emit_thread(&conversation_id, UpdateTrigger::StatusChanged, None);
            }
            ChatEvent::ReactionUpdated {
                message_id,
                reactions,
            } => {
                let conversation_id = {
                    let mut store = self.store.write().await;
                    if !store.merge_reactions(&message_id, reactions) {
                        return;
                    }
                    store.locate(&message_id).cloned()
                };
                if let Some(conversation_id) = conversation_id {
                    let message = self.store.read().await.get(&message_id).cloned();
                    self.emit_thread(&conversation_id, UpdateTrigger::MessageUpdated, message);
                }
            }
            ChatEvent::TypingStarted {
                conversation_id,
                user_id,
                user_name,
            } => {
                // Our own typing echoes back; never show it.
                if user_id != self.identity.user_id() {
                    self.typing
                        .started(&conversation_id, user_id, user_name, Utc::now());
                }
            }
            ChatEvent::TypingStopped {
                conversation_id,
                user_id,
            } => {
                self.typing.stopped(&conversation_id, &user_id);
            }
            ChatEvent::PresenceOnline { user_id } => {
                self.registry
                    .write()
                    .await
                    .set_peer_presence(&user_id, true, None);
            }
            ChatEvent::PresenceOffline { user_id, last_seen } => {
                self.registry
                    .write()
                    .await
                    .set_peer_presence(&user_id, false, last_seen);
            }
            ChatEvent::ConversationUpdated {
                conversation_id,
                patch,
            } => {
                self.registry.write().await.update(&conversation_id, |c| {
                    if let Some(name) = patch.name {
                        c.name = name;
                    }
                    if let Some(description) = patch.description {
                        c.description = Some(description);
                    }
                    if let Some(member_count) = patch.member_count {
                        c.member_count = member_count;
                    }
                    if let Some(muted) = patch.is_muted {
                        c.muted = muted;
                    }
                    if let Some(archived) = patch.is_archived {
                        c.archived = archived;
                    }
                    if let Some(pinned) = patch.is_pinned {
                        c.pinned = pinned;
                    }
                });
            }
            ChatEvent::MemberJoined {
                conversation_id, ..
            } => {
                self.registry.write().await.update(&conversation_id, |c| {
                    c.member_count = c.member_count.saturating_add(1);
                });
            }
            ChatEvent::MemberLeft {
                conversation_id, ..
            } => {
                self.registry.write().await.update(&conversation_id, |c| {
                    c.member_count = c.member_count.saturating_sub(1);
                });
            }
            // Handled in apply_event before buffering.
            ChatEvent::ConnectionUp | ChatEvent::ConnectionDown => {}
        }
    }

    /// Merge a pushed message. Echoes of our own sends swap the
    /// optimistic record for the server one; a duplicate echo or a
    /// message already landed via REST only patches in place.
    async fn merge_incoming_message(&self, message: crate::nabo::message::Message) {
        let conversation_id = message.conversation_id.clone();
        let viewer = self.identity.user_id();

        let correlation = match &message.correlation {
            Some(token) => Some(token.clone()),
            // Fallback for servers that drop the token: pair our own
            // echo with a queued draft by content and time proximity.
            None if message.sender_id == viewer => {
                self.queue.lock().await.find_queued_by_content(
                    &conversation_id,
                    &message.content,
                    message.created_at,
                    CONTENT_MATCH_WINDOW_SECS,
                )
            }
            None => None,
        };

        let reclaimed = match &correlation {
            Some(token) => {
                let mut queue = self.queue.lock().await;
                if queue.mark_reconciled(token) {
                    queue.drop_by_correlation(token)
                } else {
                    // Duplicate echo; the append below patches, never
                    // grows the thread.
                    None
                }
            }
            None => None,
        };

        if let Some(record) = reclaimed {
            {
                let mut store = self.store.write().await;
                if !store.replace(&record.temp_id, message.clone()) {
                    store.append(message.clone());
                }
            }
            self.registry.write().await.note_message(&message);
            self.refresh_window_from_store(&conversation_id).await;
            self.emit_thread(
                &conversation_id,
                UpdateTrigger::StatusChanged,
                Some(message),
            );
            self.persist_queue(&conversation_id).await;
            return;
        }

        let outcome = self.store.write().await.append(message.clone());
        match outcome {
            AppendOutcome::Appended => {
                {
                    let mut registry = self.registry.write().await;
                    registry.note_message(&message);
                    if message.sender_id != viewer {
                        registry.increment_unread(&conversation_id);
                    }
                }
                let active = self.registry.read().await.active().cloned();
                {
                    let mut history = self.history.lock().await;
                    let _ =
                        history.append_live(&conversation_id, message.clone(), active.as_ref());
                }
                self.emit_thread(&conversation_id, UpdateTrigger::NewMessage, Some(message));
            }
            AppendOutcome::Patched => {
                self.refresh_window_from_store(&conversation_id).await;
                self.emit_thread(
                    &conversation_id,
                    UpdateTrigger::MessageUpdated,
                    Some(message),
                );
            }
        }
    }
}
