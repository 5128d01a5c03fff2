//! Realtime chat core.
//!
//! [`Nabo`] is the embedder-facing facade. It owns the conversation
//! registry, the message store, the history cache, the outbound queue
//! and the typing tracker, wires the transport's event stream into the
//! merger, and runs the background event loop. Hosts interact through
//! the operations here plus per-conversation broadcast streams.

use chrono::Utc;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{watch, Mutex, RwLock};

pub mod conversation;
pub mod history;
pub mod message;
mod merger;
pub mod outbound;
pub mod presence;
pub mod storage;
pub mod store;
pub mod streams;

use crate::error::{NaboError, Result};
use crate::identity::IdentityProvider;
use crate::notifier::{NoticeLevel, Notifier};
use crate::transport::ws::{ClientFrame, EventSocket};
use crate::transport::{
    ConnectivityFlag, ConversationSettings, DeleteScope, ErrorClass, HttpTransport, MessageDraft,
    PageQuery, Transport, TransportError,
};
use crate::types::{
    new_correlation_token, new_temp_id, ConversationId, MessageId, ProcessableEvent, RetryInfo,
    UserId,
};
use conversation::{Conversation, ConversationKind, ConversationRegistry, Selection};
use history::{HistoryCache, HistoryWindow, DEFAULT_HISTORY_CAPACITY};
use merger::ResyncState;
use message::{DeliveryStatus, ForwardInfo, Message, ReplySnapshot};
use outbound::{OutboundQueue, OutboundRecord};
use presence::{TypingEntry, TypingTracker};
use storage::{MemoryOutboundStorage, OutboundStorage, SqliteOutboundStorage};
use store::MessageStore;
use streams::{ThreadStreamManager, ThreadUpdate, UpdateTrigger};

/// Minimum gap between two typing frames for the same conversation.
const TYPING_SEND_THROTTLE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct NaboConfig {
    /// Base URL of the REST API, e.g. `https://host/`.
    pub api_base_url: String,

    /// URL of the WebSocket event endpoint.
    pub ws_url: String,

    /// Directory for local persistence (outbound queue). Without one
    /// the queue lives in memory only.
    pub data_dir: Option<PathBuf>,

    /// Directory for application logs.
    pub logs_dir: Option<PathBuf>,

    /// Messages per history page.
    pub page_size: usize,

    /// Global history cache budget, in messages.
    pub history_capacity: usize,

    /// Retry ceiling for outbound dispatch and user-initiated calls.
    pub max_send_attempts: u32,
}

impl NaboConfig {
    pub fn new(api_base_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ws_url: ws_url.into(),
            data_dir: None,
            logs_dir: None,
            page_size: 50,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_send_attempts: 5,
        }
    }
}

pub struct Nabo {
    pub config: NaboConfig,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
    transport: Arc<dyn Transport>,
    outbound_storage: Arc<dyn OutboundStorage>,

    registry: RwLock<ConversationRegistry>,
    store: RwLock<MessageStore>,
    history: Mutex<HistoryCache>,
    queue: Mutex<OutboundQueue>,
    typing: TypingTracker,
    streams: ThreadStreamManager,
    pub(crate) resync: Mutex<ResyncState>,

    event_sender: Sender<ProcessableEvent>,
    shutdown_sender: Sender<()>,
    socket_commands: Sender<ClientFrame>,
    socket_shutdown: Sender<()>,
    connectivity_tx: watch::Sender<bool>,

    /// Raised at most once per session expiry.
    session_ended: AtomicBool,
    typing_sent: DashMap<ConversationId, Instant>,
}

impl std::fmt::Debug for Nabo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nabo").field("config", &self.config).finish()
    }
}

impl Nabo {
    /// Initialize the core: sets up logging and persistence, connects
    /// the event socket, loads the persisted outbound queue, starts
    /// the event loop and pulls the initial conversation lists.
    pub async fn start(
        config: NaboConfig,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Arc<Self>> {
        if let Some(logs_dir) = &config.logs_dir {
            std::fs::create_dir_all(logs_dir)?;
            crate::init_tracing(logs_dir);
        }
        if let Some(data_dir) = &config.data_dir {
            std::fs::create_dir_all(data_dir)?;
        }

        let connectivity = ConnectivityFlag::new();
        let transport = Arc::new(
            HttpTransport::new(&config.api_base_url, identity.clone())?
                .with_connectivity(connectivity.clone()),
        );

        let outbound_storage: Arc<dyn OutboundStorage> = match &config.data_dir {
            Some(data_dir) => Arc::new(
                SqliteOutboundStorage::new(data_dir.join("nabo-outbound.sqlite")).await?,
            ),
            None => Arc::new(MemoryOutboundStorage::new()),
        };

        let (chat_tx, mut chat_rx) = mpsc::channel(500);
        let (command_tx, command_rx) = mpsc::channel(100);
        let (socket_shutdown_tx, socket_shutdown_rx) = mpsc::channel(1);
        let socket = EventSocket::new(
            &config.ws_url,
            identity.clone(),
            chat_tx,
            connectivity.clone(),
        );
        tokio::spawn(socket.run(command_rx, socket_shutdown_rx));

        let (event_sender, event_receiver) = mpsc::channel(500);
        let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);

        // Bridge socket events into the processing loop.
        tokio::spawn({
            let event_sender = event_sender.clone();
            async move {
                while let Some(event) = chat_rx.recv().await {
                    if event_sender
                        .send(ProcessableEvent::Chat(event))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        let (connectivity_tx, _connectivity_rx) = watch::channel(false);

        let nabo = Arc::new(Self {
            identity,
            notifier,
            transport,
            outbound_storage,
            registry: RwLock::new(ConversationRegistry::new()),
            store: RwLock::new(MessageStore::new()),
            history: Mutex::new(HistoryCache::new(config.history_capacity)),
            queue: Mutex::new(OutboundQueue::new()),
            typing: TypingTracker::new(),
            streams: ThreadStreamManager::new(),
            resync: Mutex::new(ResyncState::default()),
            event_sender,
            shutdown_sender,
            socket_commands: command_tx,
            socket_shutdown: socket_shutdown_tx,
            connectivity_tx,
            session_ended: AtomicBool::new(false),
            typing_sent: DashMap::new(),
            config,
        });

        match nabo.outbound_storage.load_all().await {
            Ok(records) => {
                if !records.is_empty() {
                    tracing::debug!(
                        target: "nabo::init",
                        "Restored {} outbound record(s)",
                        records.len()
                    );
                }
                nabo.queue.lock().await.load(records);
            }
            Err(e) => {
                tracing::warn!(target: "nabo::init", "Failed to load outbound queue: {}", e);
            }
        }

        Self::start_event_loop(nabo.clone(), event_receiver, shutdown_receiver);
        nabo.bootstrap().await;

        Ok(nabo)
    }

    /// Pull initial conversation lists. Failures are logged, not fatal;
    /// an empty backend is not an error.
    async fn bootstrap(&self) {
        let mut loaded = Vec::new();
        for kind in [ConversationKind::Group, ConversationKind::Private] {
            match self.transport.list_conversations(kind).await {
                Ok(conversations) => loaded.extend(conversations),
                Err(e) => {
                    tracing::warn!(
                        target: "nabo::init",
                        "Failed to list {:?} conversations: {}",
                        kind,
                        e
                    );
                }
            }
        }
        if !loaded.is_empty() {
            let mut registry = self.registry.write().await;
            for conversation in loaded {
                registry.upsert(conversation);
            }
        }
    }

    fn start_event_loop(
        nabo: Arc<Nabo>,
        mut receiver: Receiver<ProcessableEvent>,
        mut shutdown: Receiver<()>,
    ) {
        tokio::spawn(async move {
            tracing::debug!(target: "nabo::event_loop", "Starting event processing loop");
            let mut sweep = tokio::time::interval(Duration::from_secs(1));
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    maybe_event = receiver.recv() => {
                        let Some(event) = maybe_event else { break };
                        nabo.handle(event).await;
                    }
                    _ = sweep.tick() => {
                        nabo.typing.sweep(Utc::now());
                    }
                    _ = shutdown.recv() => {
                        // Flush whatever is already queued, then stop.
                        while let Ok(event) = receiver.try_recv() {
                            nabo.handle(event).await;
                        }
                        tracing::debug!(target: "nabo::event_loop", "Event loop shut down");
                        break;
                    }
                }
            }
        });
    }

    async fn handle(&self, event: ProcessableEvent) {
        match event {
            ProcessableEvent::Chat(event) => self.apply_event(event).await,
            ProcessableEvent::RetryDispatch(conversation_id) => {
                self.dispatch_conversation(&conversation_id).await;
            }
        }
    }

    /// Graceful shutdown: persists the outbound queue and stops the
    /// socket and the event loop.
    pub async fn shutdown(&self) -> Result<()> {
        let conversation_ids = {
            let queue = self.queue.lock().await;
            let mut ids = queue.conversations_with_pending();
            ids.extend(queue.conversations_with_failed());
            ids.sort();
            ids.dedup();
            ids
        };
        for conversation_id in &conversation_ids {
            self.persist_queue(conversation_id).await;
        }
        let _ = self.socket_shutdown.send(()).await;
        let _ = self.shutdown_sender.send(()).await;
        Ok(())
    }

    // ----- conversation surface -------------------------------------

    /// Conversations sorted for display: pinned first, then by last
    /// activity.
    pub async fn conversations(&self) -> Vec<Conversation> {
        self.registry
            .read()
            .await
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn search_conversations(&self, query: &str) -> Vec<Conversation> {
        self.registry
            .read()
            .await
            .search(query)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.registry.read().await.get(conversation_id).cloned()
    }

    /// Make a conversation active and return its visible window.
    ///
    /// A cached window is returned immediately with a background tail
    /// refresh; otherwise the tail page is fetched and seeds the cache.
    /// Switching cancels the previous selection's pending fetches by
    /// epoch: their results are discarded, never merged.
    pub async fn select_conversation(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>> {
        let (selection, kind) = {
            let mut registry = self.registry.write().await;
            let kind = registry
                .get(conversation_id)
                .ok_or_else(|| NaboError::ConversationNotFound(conversation_id.clone()))?
                .kind;
            (registry.select(conversation_id), kind)
        };
        let Some(selection) = selection else {
            return Err(NaboError::ConversationNotFound(conversation_id.clone()));
        };

        let viewer = self.identity.user_id();
        let epoch = match selection {
            Selection::AlreadyActive => {
                return Ok(self.visible_window(conversation_id, &viewer).await);
            }
            Selection::Changed { previous, epoch } => {
                if let Some(previous) = previous {
                    self.typing.clear_conversation(&previous);
                }
                epoch
            }
        };

        let _ = self
            .socket_commands
            .send(ClientFrame::Join {
                kind,
                conversation_id: conversation_id.clone(),
            })
            .await;

        // Store already warm: render it and refresh in the background.
        let store_has_thread = self.store.read().await.thread_len(conversation_id) > 0;
        if store_has_thread {
            self.history.lock().await.touch(conversation_id);
            self.spawn_tail_refresh(conversation_id.clone(), kind, epoch);
            return Ok(self.visible_window(conversation_id, &viewer).await);
        }

        // Cached window without store rows (e.g. after restart).
        let cached = {
            let mut history = self.history.lock().await;
            history.get(conversation_id).cloned()
        };
        if let Some(window) = cached {
            self.store
                .write()
                .await
                .load_initial(conversation_id, window.messages);
            self.spawn_tail_refresh(conversation_id.clone(), kind, epoch);
            return Ok(self.visible_window(conversation_id, &viewer).await);
        }

        // Cold: fetch the tail page now.
        let page = self
            .transport
            .list_messages(kind, conversation_id, PageQuery::tail(self.config.page_size))
            .await?;

        if self.registry.read().await.epoch() != epoch {
            tracing::debug!(
                target: "nabo::select",
                "Discarding stale history fetch for {}",
                conversation_id
            );
            return Ok(Vec::new());
        }

        self.store
            .write()
            .await
            .load_initial(conversation_id, page.messages.clone());
        let active = Some(conversation_id.clone());
        let _ = self.history.lock().await.put(
            conversation_id.clone(),
            HistoryWindow {
                messages: page.messages,
                has_more_before: page.has_more_before,
            },
            active.as_ref(),
        );
        self.emit_thread(conversation_id, UpdateTrigger::WindowReloaded, None);

        Ok(self.visible_window(conversation_id, &viewer).await)
    }

    fn spawn_tail_refresh(self: &Arc<Self>, conversation_id: ConversationId, kind: ConversationKind, epoch: u64) {
        let nabo = self.clone();
        tokio::spawn(async move {
            let page = match nabo
                .transport
                .list_messages(
                    kind,
                    &conversation_id,
                    PageQuery::tail(nabo.config.page_size),
                )
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::debug!(
                        target: "nabo::select",
                        "Tail refresh for {} failed: {}",
                        conversation_id,
                        e
                    );
                    return;
                }
            };
            if nabo.registry.read().await.epoch() != epoch {
                return;
            }
            nabo.merge_tail_page(&conversation_id, page.messages, page.has_more_before)
                .await;
        });
    }

    /// Load the page preceding the current window.
    pub async fn load_older_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>> {
        let kind = self
            .registry
            .read()
            .await
            .get(conversation_id)
            .ok_or_else(|| NaboError::ConversationNotFound(conversation_id.clone()))?
            .kind;

        if !self.history.lock().await.has_more_before(conversation_id) {
            return Ok(Vec::new());
        }

        let before = self
            .store
            .read()
            .await
            .thread(conversation_id)
            .iter()
            .find(|m| !m.is_optimistic())
            .map(|m| m.id.clone());
        let query = match before {
            Some(cursor) => PageQuery::before(cursor, self.config.page_size),
            None => PageQuery::tail(self.config.page_size),
        };

        let page = self.transport.list_messages(kind, conversation_id, query).await?;
        let older = page.messages.clone();
        {
            let mut store = self.store.write().await;
            store.prepend(conversation_id, page.messages);
        }
        self.refresh_window(conversation_id, page.has_more_before).await;
        self.emit_thread(conversation_id, UpdateTrigger::WindowReloaded, None);
        Ok(older)
    }

    pub async fn create_group(
        &self,
        name: &str,
        member_ids: &[UserId],
    ) -> Result<Conversation> {
        let conversation = self
            .with_retries(|| self.transport.create_group(name, member_ids))
            .await?;
        self.registry.write().await.upsert(conversation.clone());
        Ok(conversation)
    }

    pub async fn create_private(&self, peer_id: &UserId) -> Result<Conversation> {
        let conversation = self
            .with_retries(|| self.transport.create_private(peer_id))
            .await?;
        self.registry.write().await.upsert(conversation.clone());
        Ok(conversation)
    }

    pub async fn update_conversation_settings(
        &self,
        conversation_id: &ConversationId,
        settings: ConversationSettings,
    ) -> Result<()> {
        let kind = self
            .registry
            .read()
            .await
            .get(conversation_id)
            .ok_or_else(|| NaboError::ConversationNotFound(conversation_id.clone()))?
            .kind;
        self.with_retries(|| {
            self.transport
                .update_conversation_settings(kind, conversation_id, settings.clone())
        })
        .await?;
        self.registry.write().await.update(conversation_id, |c| {
            if let Some(name) = &settings.name {
                c.name = name.clone();
            }
            if let Some(description) = &settings.description {
                c.description = Some(description.clone());
            }
            if let Some(muted) = settings.is_muted {
                c.muted = muted;
            }
            if let Some(archived) = settings.is_archived {
                c.archived = archived;
            }
            if let Some(pinned) = settings.is_pinned {
                c.pinned = pinned;
            }
        });
        Ok(())
    }

    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        let kind = self
            .registry
            .read()
            .await
            .get(conversation_id)
            .ok_or_else(|| NaboError::ConversationNotFound(conversation_id.clone()))?
            .kind;
        self.with_retries(|| self.transport.delete_conversation(kind, conversation_id))
            .await?;

        self.registry.write().await.remove(conversation_id);
        self.store.write().await.drop_conversation(conversation_id);
        self.history.lock().await.invalidate(conversation_id);
        self.typing.clear_conversation(conversation_id);
        {
            let mut queue = self.queue.lock().await;
            queue.clear_failed(conversation_id);
        }
        self.persist_queue(conversation_id).await;
        let _ = self
            .socket_commands
            .send(ClientFrame::Leave {
                kind,
                conversation_id: conversation_id.clone(),
            })
            .await;
        Ok(())
    }

    // ----- message surface ------------------------------------------

    /// Visible thread for the current user.
    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let viewer = self.identity.user_id();
        self.visible_window(conversation_id, &viewer).await
    }

    pub async fn subscribe_thread(
        &self,
        conversation_id: &ConversationId,
    ) -> tokio::sync::broadcast::Receiver<ThreadUpdate> {
        self.streams.subscribe(conversation_id)
    }

    /// Optimistic send. The returned message carries a temp id and
    /// `sending` (connected) or `queued` (offline) status; the store
    /// swaps it for the server record on reconciliation.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        draft: MessageDraft,
    ) -> Result<Message> {
        let kind = self
            .registry
            .read()
            .await
            .get(conversation_id)
            .ok_or_else(|| NaboError::ConversationNotFound(conversation_id.clone()))?
            .kind;

        let temp_id = new_temp_id();
        let correlation = new_correlation_token();
        let connected = self.transport.is_connected();

        let reply_to = match &draft.reply_to_id {
            Some(reply_id) => {
                let store = self.store.read().await;
                store.get(reply_id).map(|target| ReplySnapshot {
                    message_id: target.id.clone(),
                    content: target.content.clone(),
                    sender_id: target.sender_id.clone(),
                    sender_name: target.sender_name.clone(),
                    kind: target.kind,
                })
            }
            None => None,
        };

        let mut message = Message::optimistic(
            temp_id.clone(),
            correlation.clone(),
            conversation_id.clone(),
            self.identity.user_id(),
            self.identity.display_name(),
            draft.kind,
            draft.content.clone(),
            draft.attachments.clone(),
            reply_to,
            draft.forwarded_from.clone(),
            Utc::now(),
        );
        if !connected {
            message.status = DeliveryStatus::Queued;
        }

        {
            let mut store = self.store.write().await;
            store.append(message.clone());
        }
        self.registry.write().await.note_message(&message);
        let active = self.registry.read().await.active().cloned();
        {
            let mut history = self.history.lock().await;
            let _ = history.append_live(conversation_id, message.clone(), active.as_ref());
        }
        self.emit_thread(
            conversation_id,
            UpdateTrigger::NewMessage,
            Some(message.clone()),
        );

        let record = OutboundRecord {
            temp_id,
            correlation,
            conversation_id: conversation_id.clone(),
            conversation_kind: kind,
            draft,
            retry: RetryInfo::new(self.config.max_send_attempts),
            failed: false,
            created_at: message.created_at,
        };
        self.queue.lock().await.enqueue(record);
        self.persist_queue(conversation_id).await;

        if connected {
            self.dispatch_conversation(conversation_id).await;
        }

        Ok(message)
    }

    /// Forward an existing message into another conversation.
    pub async fn forward_message(
        &self,
        message_id: &MessageId,
        to_conversation_id: &ConversationId,
    ) -> Result<Message> {
        let source = self
            .store
            .read()
            .await
            .get(message_id)
            .cloned()
            .ok_or_else(|| NaboError::MessageNotFound(message_id.clone()))?;

        let draft = MessageDraft {
            kind: source.kind,
            content: source.content.clone(),
            attachments: source.attachments.clone(),
            reply_to_id: None,
            forwarded_from: Some(ForwardInfo {
                message_id: source.server_id.clone().unwrap_or(source.id.clone()),
                sender_id: source.sender_id.clone(),
                sender_name: source.sender_name.clone(),
                conversation_id: source.conversation_id.clone(),
                forwarded_by: self.identity.user_id(),
            }),
        };
        self.send_message(to_conversation_id, draft).await
    }

    /// Retry a failed outbound message. Re-enqueues at the tail, so
    /// later messages that already went out keep their order.
    pub async fn retry_message(&self, temp_id: &MessageId) -> Result<()> {
        let conversation_id = {
            let mut queue = self.queue.lock().await;
            queue
                .retry_failed(temp_id)
                .map(|r| r.conversation_id.clone())
        };
        let Some(conversation_id) = conversation_id else {
            return Err(NaboError::MessageNotFound(temp_id.clone()));
        };

        {
            let mut store = self.store.write().await;
            store.patch(temp_id, |m| {
                m.advance_status(DeliveryStatus::Sending);
            });
        }
        let updated = self.store.read().await.get(temp_id).cloned();
        self.emit_thread(&conversation_id, UpdateTrigger::StatusChanged, updated);
        self.persist_queue(&conversation_id).await;

        if self.transport.is_connected() {
            self.dispatch_conversation(&conversation_id).await;
        }
        Ok(())
    }

    /// Drop a failed outbound message from the queue and the store.
    pub async fn remove_failed_message(&self, temp_id: &MessageId) -> Result<()> {
        let record = self.queue.lock().await.remove_failed(temp_id);
        let Some(record) = record else {
            return Err(NaboError::MessageNotFound(temp_id.clone()));
        };
        self.store.write().await.remove(temp_id);
        self.emit_thread(
            &record.conversation_id,
            UpdateTrigger::MessageDeleted,
            None,
        );
        self.persist_queue(&record.conversation_id).await;
        Ok(())
    }

    /// Drop every failed outbound message in one conversation.
    pub async fn clear_failed_messages(&self, conversation_id: &ConversationId) -> Result<()> {
        let cleared = self.queue.lock().await.clear_failed(conversation_id);
        if !cleared.is_empty() {
            let mut store = self.store.write().await;
            for record in &cleared {
                store.remove(&record.temp_id);
            }
            drop(store);
            self.emit_thread(conversation_id, UpdateTrigger::MessageDeleted, None);
        }
        self.persist_queue(conversation_id).await;
        Ok(())
    }

    pub async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<Message> {
        let previous = {
            let mut store = self.store.write().await;
            let previous = store.get(message_id).map(|m| m.content.clone());
            store.patch(message_id, |m| {
                m.content = content.to_string();
                m.is_edited = true;
                m.edited_at = Some(Utc::now());
            });
            previous
        };
        let Some(previous) = previous else {
            return Err(NaboError::MessageNotFound(message_id.clone()));
        };
        self.emit_message_update(message_id).await;

        match self
            .with_retries(|| self.transport.edit_message(message_id, content))
            .await
        {
            Ok(server_message) => {
                self.store.write().await.append(server_message.clone());
                self.emit_message_update(message_id).await;
                Ok(server_message)
            }
            Err(e) => {
                let mut store = self.store.write().await;
                store.patch(message_id, |m| {
                    m.content = previous;
                });
                drop(store);
                self.emit_message_update(message_id).await;
                self.surface_failure("Couldn't edit message", &e);
                Err(e)
            }
        }
    }

    /// Soft delete. `Everyone` hides the message for all participants,
    /// `Me` only for the current user. Applied optimistically and
    /// reverted if the server rejects it.
    pub async fn delete_message(
        &self,
        message_id: &MessageId,
        scope: DeleteScope,
    ) -> Result<()> {
        let viewer = self.identity.user_id();
        let snapshot = {
            let mut store = self.store.write().await;
            let snapshot = store
                .get(message_id)
                .map(|m| (m.is_deleted, m.deleted_for.clone()));
            store.patch(message_id, |m| match scope {
                DeleteScope::Everyone => {
                    m.is_deleted = true;
                    m.deleted_for = Vec::new();
                }
                DeleteScope::Me => {
                    m.is_deleted = true;
                    if !m.deleted_for.contains(&viewer) {
                        m.deleted_for.push(viewer.clone());
                    }
                }
            });
            snapshot
        };
        let Some((was_deleted, previous_deleted_for)) = snapshot else {
            return Err(NaboError::MessageNotFound(message_id.clone()));
        };
        if let Some(conversation_id) = self.store.read().await.locate(message_id).cloned() {
            self.emit_thread(&conversation_id, UpdateTrigger::MessageDeleted, None);
        }

        match self
            .with_retries(|| self.transport.soft_delete_message(message_id, scope))
            .await
        {
            Ok(()) => {
                if scope == DeleteScope::Everyone {
                    // Confirmed global delete: drop the record outright.
                    let removed = {
                        let mut store = self.store.write().await;
                        store.remove(message_id)
                    };
                    if let Some(removed) = removed {
                        self.refresh_window_from_store(&removed.conversation_id).await;
                        self.emit_thread(
                            &removed.conversation_id,
                            UpdateTrigger::MessageDeleted,
                            None,
                        );
                    }
                }
                Ok(())
            }
            Err(e) => {
                let mut store = self.store.write().await;
                store.patch(message_id, |m| {
                    m.is_deleted = was_deleted;
                    m.deleted_for = previous_deleted_for;
                });
                drop(store);
                self.emit_message_update(message_id).await;
                self.surface_failure("Couldn't delete message", &e);
                Err(e)
            }
        }
    }

    /// Toggle the current user's reaction. Same kind removes it, a
    /// different kind replaces it. The server's summary is merged back
    /// as authoritative.
    pub async fn react(&self, message_id: &MessageId, reaction_kind: &str) -> Result<()> {
        let viewer = self.identity.user_id();
        let known = {
            let mut store = self.store.write().await;
            store.patch(message_id, |m| {
                m.reactions.toggle(&viewer, reaction_kind);
            })
        };
        if !known {
            return Err(NaboError::MessageNotFound(message_id.clone()));
        }
        self.emit_message_update(message_id).await;

        match self
            .with_retries(|| self.transport.react(message_id, reaction_kind))
            .await
        {
            Ok(reactions) => {
                self.store
                    .write()
                    .await
                    .merge_reactions(message_id, reactions);
                self.emit_message_update(message_id).await;
                Ok(())
            }
            Err(e) => {
                // Undo the optimistic toggle.
                let mut store = self.store.write().await;
                store.patch(message_id, |m| {
                    m.reactions.toggle(&viewer, reaction_kind);
                });
                drop(store);
                self.emit_message_update(message_id).await;
                self.surface_failure("Couldn't update reaction", &e);
                Err(e)
            }
        }
    }

    /// Mark messages read for the current user, locally and upstream.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<()> {
        if message_ids.is_empty() {
            self.registry.write().await.clear_unread(conversation_id);
            return Ok(());
        }
        let viewer = self.identity.user_id();
        let read_at = Utc::now();
        {
            let mut store = self.store.write().await;
            for message_id in message_ids {
                store.mark_read(message_id, viewer.clone(), read_at);
            }
        }
        self.registry.write().await.clear_unread(conversation_id);
        self.emit_thread(conversation_id, UpdateTrigger::StatusChanged, None);

        self.with_retries(|| self.transport.mark_read(conversation_id, message_ids, read_at))
            .await
    }

    // ----- typing & presence ----------------------------------------

    /// Announce that the current user is typing. Throttled so repeated
    /// keystrokes produce at most one frame per two seconds.
    pub async fn typing_started(&self, conversation_id: &ConversationId) {
        let now = Instant::now();
        let should_send = self
            .typing_sent
            .get(conversation_id)
            .map(|last| now.duration_since(*last) >= TYPING_SEND_THROTTLE)
            .unwrap_or(true);
        if !should_send {
            return;
        }
        self.typing_sent.insert(conversation_id.clone(), now);
        let _ = self
            .socket_commands
            .send(ClientFrame::TypingStart {
                conversation_id: conversation_id.clone(),
            })
            .await;
    }

    pub async fn typing_stopped(&self, conversation_id: &ConversationId) {
        self.typing_sent.remove(conversation_id);
        let _ = self
            .socket_commands
            .send(ClientFrame::TypingStop {
                conversation_id: conversation_id.clone(),
            })
            .await;
    }

    /// Users currently typing in a conversation.
    pub fn typing_users(&self, conversation_id: &ConversationId) -> Vec<TypingEntry> {
        self.typing.typing_in(conversation_id, Utc::now())
    }

    // ----- connectivity & session -----------------------------------

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Observable connectivity, for rendering an offline banner.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity_tx.subscribe()
    }

    /// Call after the host obtained a fresh session token: unpauses the
    /// outbound queue and drains it.
    pub async fn session_renewed(&self) {
        self.session_ended.store(false, Ordering::SeqCst);
        let pending = {
            let mut queue = self.queue.lock().await;
            queue.resume();
            queue.conversations_with_pending()
        };
        for conversation_id in pending {
            self.dispatch_conversation(&conversation_id).await;
        }
    }

    // ----- outbound dispatch ----------------------------------------

    /// Drain one conversation's outbound queue, head first, one record
    /// in flight at a time. Transient failures schedule a delayed
    /// retry through the event loop; permanent ones move the record to
    /// the failed set and surface.
    pub(crate) async fn dispatch_conversation(&self, conversation_id: &ConversationId) {
        loop {
            let record = self.queue.lock().await.start(conversation_id);
            let Some(record) = record else { return };

            {
                let mut store = self.store.write().await;
                store.patch(&record.temp_id, |m| {
                    m.advance_status(DeliveryStatus::Sending);
                });
            }

            let result = self
                .transport
                .send_message(
                    record.conversation_kind,
                    conversation_id,
                    &record.draft,
                    &record.correlation,
                )
                .await;

            match result {
                Ok(server_message) => {
                    let echo_won = {
                        let mut queue = self.queue.lock().await;
                        if queue.is_reconciled(&record.correlation) {
                            // The WS echo reconciled this record first;
                            // the reply only patches.
                            queue.release(conversation_id);
                            true
                        } else {
                            queue.succeed(conversation_id);
                            false
                        }
                    };
                    {
                        let mut store = self.store.write().await;
                        if echo_won {
                            store.append(server_message.clone());
                        } else {
                            store.replace(&record.temp_id, server_message.clone());
                        }
                    }
                    self.registry.write().await.note_message(&server_message);
                    self.refresh_window_from_store(conversation_id).await;
                    self.emit_thread(
                        conversation_id,
                        UpdateTrigger::StatusChanged,
                        Some(server_message),
                    );
                    self.persist_queue(conversation_id).await;
                }
                Err(e) if e.class == ErrorClass::Auth => {
                    {
                        let mut queue = self.queue.lock().await;
                        queue.release(conversation_id);
                        queue.pause();
                    }
                    self.raise_session_ended();
                    return;
                }
                Err(e) => {
                    let echo_won = {
                        let mut queue = self.queue.lock().await;
                        if queue.is_reconciled(&record.correlation) {
                            // The echo confirmed this record while the
                            // call was in flight; the failed reply
                            // belongs to a send that already landed.
                            queue.release(conversation_id);
                            true
                        } else {
                            false
                        }
                    };
                    if echo_won {
                        self.persist_queue(conversation_id).await;
                        continue;
                    }
                    if e.retryable() {
                        let retry = self
                            .queue
                            .lock()
                            .await
                            .retry_later(conversation_id, &record.temp_id);
                        match retry {
                            Some(retry) => {
                                tracing::debug!(
                                    target: "nabo::outbound",
                                    "Send failed, retry {}/{} in {}ms: {}",
                                    retry.attempt,
                                    retry.max_attempts,
                                    retry.delay_ms(),
                                    e
                                );
                                self.schedule_retry(conversation_id.clone(), retry);
                                return;
                            }
                            None => {
                                self.fail_head(conversation_id, &record.temp_id, &e).await;
                            }
                        }
                    } else {
                        self.fail_head(conversation_id, &record.temp_id, &e).await;
                    }
                }
            }
        }
    }

    async fn fail_head(
        &self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
        error: &TransportError,
    ) {
        let failed = self.queue.lock().await.fail(conversation_id, temp_id);
        let Some(record) = failed else { return };

        self.store.write().await.mark_failed(&record.temp_id);
        let updated = self.store.read().await.get(&record.temp_id).cloned();
        self.emit_thread(conversation_id, UpdateTrigger::StatusChanged, updated);
        self.persist_queue(conversation_id).await;
        self.surface_failure(
            "Couldn't send message",
            &NaboError::Transport(error.clone()),
        );
    }

    fn schedule_retry(&self, conversation_id: ConversationId, retry: RetryInfo) {
        let sender = self.event_sender.clone();
        let delay = retry.delay_with_jitter();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender
                .send(ProcessableEvent::RetryDispatch(conversation_id))
                .await;
        });
    }

    // ----- helpers ---------------------------------------------------

    async fn visible_window(
        &self,
        conversation_id: &ConversationId,
        viewer: &UserId,
    ) -> Vec<Message> {
        self.store
            .read()
            .await
            .visible_thread(conversation_id, viewer)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Merge a freshly pulled tail page into the store and the cache.
    /// Duplicates are dropped by server id.
    pub(crate) async fn merge_tail_page(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<Message>,
        has_more_before: bool,
    ) {
        {
            let mut store = self.store.write().await;
            store.prepend(conversation_id, messages);
        }
        self.refresh_window(conversation_id, has_more_before).await;
        self.emit_thread(conversation_id, UpdateTrigger::WindowReloaded, None);
    }

    async fn refresh_window(&self, conversation_id: &ConversationId, has_more_before: bool) {
        let messages = self.store.read().await.thread(conversation_id).to_vec();
        let mut history = self.history.lock().await;
        if history.contains(conversation_id) {
            history.refresh(conversation_id, messages, has_more_before);
        } else {
            let active = None;
            let _ = history.put(
                conversation_id.clone(),
                HistoryWindow {
                    messages,
                    has_more_before,
                },
                active,
            );
        }
    }

    pub(crate) async fn refresh_window_from_store(&self, conversation_id: &ConversationId) {
        let has_more = self.history.lock().await.has_more_before(conversation_id);
        self.refresh_window(conversation_id, has_more).await;
    }

    pub(crate) fn emit_thread(
        &self,
        conversation_id: &ConversationId,
        trigger: UpdateTrigger,
        message: Option<Message>,
    ) {
        self.streams.emit(
            conversation_id,
            ThreadUpdate {
                trigger,
                conversation_id: conversation_id.clone(),
                message,
            },
        );
    }

    async fn emit_message_update(&self, message_id: &MessageId) {
        let store = self.store.read().await;
        let Some(conversation_id) = store.locate(message_id).cloned() else {
            return;
        };
        let message = store.get(message_id).cloned();
        drop(store);
        self.emit_thread(&conversation_id, UpdateTrigger::MessageUpdated, message);
    }

    pub(crate) async fn persist_queue(&self, conversation_id: &ConversationId) {
        let records = self.queue.lock().await.records_for(conversation_id);
        if let Err(e) = self
            .outbound_storage
            .save_conversation(conversation_id, &records)
            .await
        {
            tracing::warn!(
                target: "nabo::outbound",
                "Failed to persist outbound queue for {}: {}",
                conversation_id,
                e
            );
        }
    }

    pub(crate) fn raise_session_ended(&self) {
        if !self.session_ended.swap(true, Ordering::SeqCst) {
            self.notifier.session_ended();
        }
    }

    fn surface_failure(&self, label: &str, error: &NaboError) {
        let detail = match error {
            NaboError::SessionEnded => {
                self.raise_session_ended();
                return;
            }
            NaboError::Transport(e) if e.class == ErrorClass::Auth => {
                self.raise_session_ended();
                return;
            }
            NaboError::Transport(e) => e.message.clone(),
            other => other.to_string(),
        };
        self.notifier
            .notify(NoticeLevel::Error, &format!("{label}: {detail}"));
    }

    /// Retry a user-initiated transport call on transient failures, up
    /// to the configured ceiling. Auth failures end the session
    /// immediately; other permanent failures return as-is.
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, TransportError>>,
    {
        let mut retry = RetryInfo::new(self.config.max_send_attempts);
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.class == ErrorClass::Auth => {
                    self.raise_session_ended();
                    return Err(NaboError::SessionEnded);
                }
                Err(e) if e.retryable() => match retry.next_attempt() {
                    Some(next) => {
                        retry = next;
                        tokio::time::sleep(retry.delay_with_jitter()).await;
                    }
                    None => return Err(e.into()),
                },
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::identity::StaticIdentity;
    use crate::transport::Page;
    use super::message::{MessageKind, ReactionSummary};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;

    /// Scriptable in-memory backend. Sends succeed by default and
    /// fabricate a server record echoing the correlation token;
    /// `send_results` scripts failures, `next_server_ids` the ids the
    /// fabricated records get.
    pub(crate) struct MockTransport {
        pub connected: AtomicBool,
        pub send_results: StdMutex<VecDeque<std::result::Result<(), TransportError>>>,
        /// Scripted failures for edit/delete/react calls.
        pub request_results: StdMutex<VecDeque<std::result::Result<(), TransportError>>>,
        pub next_server_ids: StdMutex<VecDeque<String>>,
        pub pages: StdMutex<HashMap<ConversationId, Page>>,
        /// (conversation, content, correlation) per accepted send.
        pub sent: StdMutex<Vec<(ConversationId, String, String)>>,
        counter: AtomicU64,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                connected: AtomicBool::new(true),
                send_results: StdMutex::new(VecDeque::new()),
                request_results: StdMutex::new(VecDeque::new()),
                next_server_ids: StdMutex::new(VecDeque::new()),
                pages: StdMutex::new(HashMap::new()),
                sent: StdMutex::new(Vec::new()),
                counter: AtomicU64::new(0),
            }
        }

        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        fn fabricate(
            &self,
            conversation_id: &ConversationId,
            draft: &MessageDraft,
            correlation: &str,
        ) -> Message {
            let id = self
                .next_server_ids
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    format!("srv-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
                });
            let mut message = Message::optimistic(
                id.clone(),
                correlation.to_string(),
                conversation_id.clone(),
                "u1".to_string(),
                "Alice".to_string(),
                draft.kind,
                draft.content.clone(),
                draft.attachments.clone(),
                None,
                draft.forwarded_from.clone(),
                Utc::now(),
            );
            message.server_id = Some(id);
            message.status = DeliveryStatus::Sent;
            message
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn list_conversations(
            &self,
            _kind: ConversationKind,
        ) -> std::result::Result<Vec<Conversation>, TransportError> {
            Ok(Vec::new())
        }

        async fn list_messages(
            &self,
            _kind: ConversationKind,
            conversation_id: &ConversationId,
            _query: PageQuery,
        ) -> std::result::Result<Page, TransportError> {
            Ok(self
                .pages
                .lock()
                .unwrap()
                .get(conversation_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn send_message(
            &self,
            _kind: ConversationKind,
            conversation_id: &ConversationId,
            draft: &MessageDraft,
            correlation_id: &str,
        ) -> std::result::Result<Message, TransportError> {
            if let Some(result) = self.send_results.lock().unwrap().pop_front() {
                result.map_err(|e| e.with_correlation(correlation_id))?;
            }
            self.sent.lock().unwrap().push((
                conversation_id.clone(),
                draft.content.clone(),
                correlation_id.to_string(),
            ));
            Ok(self.fabricate(conversation_id, draft, correlation_id))
        }

        async fn edit_message(
            &self,
            message_id: &MessageId,
            content: &str,
        ) -> std::result::Result<Message, TransportError> {
            if let Some(result) = self.request_results.lock().unwrap().pop_front() {
                result?;
            }
            let mut message = Message::optimistic(
                message_id.clone(),
                String::new(),
                "c1".to_string(),
                "u1".to_string(),
                "Alice".to_string(),
                MessageKind::Text,
                content.to_string(),
                Vec::new(),
                None,
                None,
                Utc::now(),
            );
            message.server_id = Some(message_id.clone());
            message.correlation = None;
            message.status = DeliveryStatus::Sent;
            message.is_edited = true;
            message.edited_at = Some(Utc::now());
            Ok(message)
        }

        async fn soft_delete_message(
            &self,
            _message_id: &MessageId,
            _scope: DeleteScope,
        ) -> std::result::Result<(), TransportError> {
            if let Some(result) = self.request_results.lock().unwrap().pop_front() {
                result?;
            }
            Ok(())
        }

        async fn react(
            &self,
            _message_id: &MessageId,
            reaction_kind: &str,
        ) -> std::result::Result<ReactionSummary, TransportError> {
            if let Some(result) = self.request_results.lock().unwrap().pop_front() {
                result?;
            }
            let mut summary = ReactionSummary::default();
            summary.toggle(&"u1".to_string(), reaction_kind);
            Ok(summary)
        }

        async fn mark_read(
            &self,
            _conversation_id: &ConversationId,
            _message_ids: &[MessageId],
            _read_at: chrono::DateTime<Utc>,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn create_group(
            &self,
            name: &str,
            _member_ids: &[UserId],
        ) -> std::result::Result<Conversation, TransportError> {
            let mut conversation = conversation::test_conversation("g-new");
            conversation.name = name.to_string();
            Ok(conversation)
        }

        async fn create_private(
            &self,
            peer_id: &UserId,
        ) -> std::result::Result<Conversation, TransportError> {
            let mut conversation = conversation::test_conversation("p-new");
            conversation.kind = ConversationKind::Private;
            conversation.peer = Some(conversation::PeerInfo {
                user_id: peer_id.clone(),
                online: false,
                last_seen: None,
            });
            Ok(conversation)
        }

        async fn update_conversation_settings(
            &self,
            _kind: ConversationKind,
            _conversation_id: &ConversationId,
            _settings: ConversationSettings,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn delete_conversation(
            &self,
            _kind: ConversationKind,
            _conversation_id: &ConversationId,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub notices: StdMutex<Vec<(NoticeLevel, String)>>,
        pub session_ended: AtomicBool,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, level: NoticeLevel, message: &str) {
            self.notices
                .lock()
                .unwrap()
                .push((level, message.to_string()));
        }

        fn session_ended(&self) {
            self.session_ended.store(true, Ordering::SeqCst);
        }
    }

    /// Kept-alive channel ends. Dropping the receivers would make the
    /// core's sends fail mid-test.
    pub(crate) struct MockHandles {
        pub transport: Arc<MockTransport>,
        pub notifier: Arc<RecordingNotifier>,
        pub events: Receiver<ProcessableEvent>,
        pub commands: Receiver<ClientFrame>,
        pub shutdown: Receiver<()>,
        pub socket_shutdown: Receiver<()>,
    }

    /// Core wired to the mock transport, without the socket task or
    /// the event loop; tests drive `apply_event` directly.
    pub(crate) async fn create_mock_nabo() -> (Arc<Nabo>, MockHandles) {
        let transport = Arc::new(MockTransport::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let identity: Arc<dyn IdentityProvider> =
            Arc::new(StaticIdentity::new("u1", "Alice"));

        let (event_sender, events) = mpsc::channel(500);
        let (shutdown_sender, shutdown) = mpsc::channel(1);
        let (socket_commands, commands) = mpsc::channel(100);
        let (socket_shutdown_sender, socket_shutdown) = mpsc::channel(1);
        let (connectivity_tx, _) = watch::channel(true);

        let config = NaboConfig::new("http://127.0.0.1:1", "ws://127.0.0.1:1");
        let nabo = Arc::new(Nabo {
            identity,
            notifier: notifier.clone(),
            transport: transport.clone(),
            outbound_storage: Arc::new(MemoryOutboundStorage::new()),
            registry: RwLock::new(ConversationRegistry::new()),
            store: RwLock::new(MessageStore::new()),
            history: Mutex::new(HistoryCache::new(config.history_capacity)),
            queue: Mutex::new(OutboundQueue::new()),
            typing: TypingTracker::new(),
            streams: ThreadStreamManager::new(),
            resync: Mutex::new(ResyncState::default()),
            event_sender,
            shutdown_sender,
            socket_commands,
            socket_shutdown: socket_shutdown_sender,
            connectivity_tx,
            session_ended: AtomicBool::new(false),
            typing_sent: DashMap::new(),
            config,
        });

        (
            nabo,
            MockHandles {
                transport,
                notifier,
                events,
                commands,
                shutdown,
                socket_shutdown,
            },
        )
    }
}
