//! Synchronization coordinator.
//!
//! The only component that both talks to the transport/REST layer and writes
//! to the [`ChatStore`](crate::stores::ChatStore). Outbound operations try the
//! socket first and fall back to REST when it is not open; inbound events are
//! reconciled against optimistic local state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use scholaris_shared::{
    ApiError, Conversation, LastMessage, Message, Notification, Recipient, ServerEvent,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::api_client::{ChatApi, MediaUpload};
use crate::auth_session::AuthSession;
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::pagination::fetch_page;
use crate::stores::SharedStore;
use crate::ws::Transport;

/// Fresh id for correlating an optimistic message with its confirmation.
pub fn new_client_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// User-facing signals the presentation layer may surface.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatNotice {
    /// Transient error text, e.g. a failed REST call.
    Toast(String),
    Notification(Notification),
    NotificationRead(i64),
    ServerError {
        code: Option<String>,
        message: String,
    },
}

/// Per-conversation "leave `last_message` to the server until T" map.
#[derive(Debug, Default)]
struct SuppressionWindow {
    until: HashMap<i64, Instant>,
}

impl SuppressionWindow {
    fn arm(&mut self, conversation_id: i64, now: Instant, window: Duration) {
        self.until.insert(conversation_id, now + window);
    }

    fn is_active(&mut self, conversation_id: i64, now: Instant) -> bool {
        match self.until.get(&conversation_id) {
            Some(deadline) if now < *deadline => true,
            Some(_) => {
                self.until.remove(&conversation_id);
                false
            }
            None => false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Coordinator<T: Transport, A: ChatApi> {
    store: SharedStore,
    transport: Arc<T>,
    api: Arc<A>,
    user_id: i64,
    config: ChatConfig,
    suppression: Mutex<SuppressionWindow>,
    typing_timers: Mutex<HashMap<i64, JoinHandle<()>>>,
    notices: broadcast::Sender<ChatNotice>,
}

impl<T: Transport, A: ChatApi> Coordinator<T, A> {
    pub fn new(
        store: SharedStore,
        transport: Arc<T>,
        api: Arc<A>,
        user_id: i64,
        config: ChatConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            store,
            transport,
            api,
            user_id,
            config,
            suppression: Mutex::new(SuppressionWindow::default()),
            typing_timers: Mutex::new(HashMap::new()),
            notices,
        }
    }

    /// Coordinator acting for the logged-in user of `session`.
    pub fn for_session(
        session: &AuthSession,
        store: SharedStore,
        transport: Arc<T>,
        api: Arc<A>,
        config: ChatConfig,
    ) -> Result<Self, ChatError> {
        if !session.is_authenticated() {
            return Err(ChatError::NotAuthenticated);
        }
        Ok(Self::new(store, transport, api, session.user_id, config))
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<ChatNotice> {
        self.notices.subscribe()
    }

    fn notify(&self, notice: ChatNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    /// Log a REST failure and show it to the user.
    fn toast(&self, context: &str, error: &ApiError) {
        crate::log_error!("{} failed: {}", context, error);
        self.notify(ChatNotice::Toast(error.user_message()));
    }

    fn arm_suppression(&self, conversation_id: i64) {
        lock(&self.suppression).arm(
            conversation_id,
            Instant::now(),
            self.config.last_message_suppression,
        );
    }

    /// Whether a locally computed `last_message` may be written right now.
    fn may_recompute(&self, conversation_id: i64) -> bool {
        let active = lock(&self.suppression).is_active(conversation_id, Instant::now());
        if active {
            crate::log_debug!(
                "Skipping local last_message recompute for conversation {}",
                conversation_id
            );
        }
        !active
    }

    // --- Conversations ---

    pub async fn load_conversations(&self) -> Result<(), ChatError> {
        match self.api.list_conversations().await {
            Ok(conversations) => {
                crate::log_debug!("Loaded {} conversations", conversations.len());
                self.store.write().await.set_conversations(conversations);
                Ok(())
            }
            Err(e) => {
                self.toast("Loading conversations", &e);
                Err(e.into())
            }
        }
    }

    pub async fn load_recipients(&self) -> Result<Vec<Recipient>, ChatError> {
        self.api.list_recipients().await.map_err(|e| {
            self.toast("Loading recipients", &e);
            e.into()
        })
    }

    /// Create (or get) the conversation with `recipient_user_id` and open it.
    pub async fn start_conversation(&self, recipient_user_id: i64) -> Result<i64, ChatError> {
        let conversation: Conversation = match self.api.create_conversation(recipient_user_id).await
        {
            Ok(conversation) => conversation,
            Err(e) => {
                self.toast("Starting conversation", &e);
                return Err(e.into());
            }
        };
        let conversation_id = conversation.conversation_id;
        self.store.write().await.upsert_conversation(conversation);
        self.open_conversation(conversation_id).await?;
        Ok(conversation_id)
    }

    /// Make `conversation_id` the active one, mark it read and load its
    /// newest page if nothing was fetched yet.
    pub async fn open_conversation(&self, conversation_id: i64) -> Result<(), ChatError> {
        let loaded = {
            let mut store = self.store.write().await;
            store.set_current_conversation_id(Some(conversation_id));
            store.is_loaded(conversation_id)
        };
        self.mark_read(conversation_id).await;

        if loaded {
            return Ok(());
        }
        if let Err(e) = fetch_page(
            self.api.as_ref(),
            &self.store,
            conversation_id,
            self.config.page_size,
            None,
        )
        .await
        {
            self.toast("Loading messages", &e);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn close_conversation(&self) {
        self.store.write().await.set_current_conversation_id(None);
    }

    /// Send a read receipt and zero the unread count without waiting for the server.
    pub async fn mark_read(&self, conversation_id: i64) {
        if !self.transport.mark_as_read(conversation_id) {
            crate::log_debug!(
                "Read receipt for conversation {} not sent; socket closed",
                conversation_id
            );
        }
        self.store
            .write()
            .await
            .mark_conversation_as_read(conversation_id);
    }

    pub async fn delete_conversation(&self, conversation_id: i64) -> Result<(), ChatError> {
        if !self.transport.delete_conversation(conversation_id) {
            if let Err(e) = self.api.delete_conversation(conversation_id).await {
                self.toast("Deleting conversation", &e);
                return Err(e.into());
            }
        }
        self.forget_conversation(conversation_id).await;
        Ok(())
    }

    async fn forget_conversation(&self, conversation_id: i64) {
        if let Some(timer) = lock(&self.typing_timers).remove(&conversation_id) {
            timer.abort();
        }
        lock(&self.suppression).until.remove(&conversation_id);
        self.store.write().await.remove_conversation(conversation_id);
    }

    // --- Messages ---

    /// Send a text message.
    ///
    /// The message shows up immediately as pending. When the socket is closed
    /// the REST endpoint is used instead and its confirmation replaces the
    /// pending entry; if that fails too the pending entry and the previous
    /// conversation summary are restored before the error is returned.
    /// Returns the client message id.
    pub async fn send_message(&self, conversation_id: i64, body: &str) -> Result<String, ChatError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let client_message_id = new_client_message_id();
        let pending = Message::pending(conversation_id, self.user_id, body, &client_message_id);
        let previous = {
            let mut store = self.store.write().await;
            let Some(conversation) = store.conversation(conversation_id) else {
                return Err(ChatError::UnknownConversation(conversation_id));
            };
            let previous = (
                conversation.last_message.clone(),
                conversation.last_message_at,
            );
            store.add_message(pending.clone());
            store.update_conversation_last_message(conversation_id, Some(pending.summary()));
            previous
        };
        self.arm_suppression(conversation_id);

        if self
            .transport
            .send_message(conversation_id, body, &client_message_id)
        {
            return Ok(client_message_id);
        }

        crate::log_debug!(
            "Socket closed; sending message {} over REST",
            client_message_id
        );
        match self
            .api
            .send_message(conversation_id, body, &client_message_id)
            .await
        {
            Ok(confirmed) => {
                self.confirm(conversation_id, confirmed).await;
                Ok(client_message_id)
            }
            Err(e) => {
                {
                    let mut store = self.store.write().await;
                    store.remove_pending(conversation_id, &client_message_id);
                    let (last_message, last_message_at) = previous;
                    store.restore_conversation_summary(
                        conversation_id,
                        last_message,
                        last_message_at,
                    );
                }
                self.toast("Sending message", &e);
                Err(e.into())
            }
        }
    }

    /// Upload a media message. There is no socket path for media.
    pub async fn send_media(
        &self,
        conversation_id: i64,
        upload: MediaUpload,
    ) -> Result<Message, ChatError> {
        match self.api.send_media(conversation_id, upload).await {
            Ok(confirmed) => {
                self.confirm(conversation_id, confirmed.clone()).await;
                Ok(confirmed)
            }
            Err(e) => {
                self.toast("Sending media", &e);
                Err(e.into())
            }
        }
    }

    /// Apply a server-confirmed message returned by REST. This is the same
    /// store effect as the optimistic socket path followed by its echo.
    async fn confirm(&self, conversation_id: i64, mut confirmed: Message) {
        confirmed.conversation_id = conversation_id;
        let summary = confirmed.summary();
        let mut store = self.store.write().await;
        store.add_message(confirmed);
        store.update_conversation_last_message(conversation_id, Some(summary));
    }

    pub async fn edit_message(&self, message_id: i64, body: &str) -> Result<(), ChatError> {
        let conversation_id = self.locate(message_id).await?;

        if self.transport.edit_message(message_id, body) {
            self.store
                .write()
                .await
                .update_message(conversation_id, message_id, body);
            return Ok(());
        }

        match self.api.edit_message(message_id, body).await {
            Ok(edited) => {
                let body = edited.body.as_deref().unwrap_or(body);
                self.store
                    .write()
                    .await
                    .update_message(conversation_id, message_id, body);
                Ok(())
            }
            Err(e) => {
                self.toast("Editing message", &e);
                Err(e.into())
            }
        }
    }

    pub async fn delete_message(&self, message_id: i64) -> Result<(), ChatError> {
        let conversation_id = self.locate(message_id).await?;

        if !self.transport.delete_message(message_id) {
            if let Err(e) = self.api.delete_message(message_id).await {
                self.toast("Deleting message", &e);
                return Err(e.into());
            }
        }
        self.remove_locally(conversation_id, message_id, false).await;
        Ok(())
    }

    /// Notify the peer that the user is typing. Socket only.
    pub fn send_typing(&self, conversation_id: i64) -> bool {
        self.transport.send_typing(conversation_id)
    }

    async fn locate(&self, message_id: i64) -> Result<i64, ChatError> {
        self.store
            .read()
            .await
            .locate_message(message_id)
            .ok_or(ChatError::UnknownMessage(message_id))
    }

    /// Remove a message; when it was the conversation's last message, the
    /// message before it becomes the new summary (or none). With `guarded`
    /// the recompute waits out the post-send window; the user's own deletes
    /// always recompute.
    async fn remove_locally(&self, conversation_id: i64, message_id: i64, guarded: bool) {
        let may_recompute = !guarded || self.may_recompute(conversation_id);
        let mut store = self.store.write().await;

        let preceding: Option<LastMessage> = {
            let list = store.messages(conversation_id);
            list.iter()
                .position(|m| m.id == Some(message_id))
                .and_then(|pos| pos.checked_sub(1))
                .map(|pos| list[pos].summary())
        };
        if store.remove_message(conversation_id, message_id).is_none() {
            return;
        }

        let was_last = store
            .conversation(conversation_id)
            .and_then(|c| c.last_message.as_ref())
            .is_some_and(|last| last.id == Some(message_id));
        if was_last && may_recompute {
            store.update_conversation_last_message(conversation_id, preceding);
        }
    }

    // --- Inbound ---

    /// Drain inbound socket events until the transport goes away.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        crate::log_debug!("Inbound event stream closed");
    }

    pub async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageNew {
                conversation_id,
                message,
            } => self.on_message(conversation_id, message).await,
            ServerEvent::MessageEdited { message_id, body } => {
                let mut store = self.store.write().await;
                if let Some(conversation_id) = store.locate_message(message_id) {
                    store.update_message(conversation_id, message_id, &body);
                }
            }
            ServerEvent::MessageDeleted { message_id } => {
                let located = self.store.read().await.locate_message(message_id);
                if let Some(conversation_id) = located {
                    self.remove_locally(conversation_id, message_id, true).await;
                }
            }
            ServerEvent::MessageRead {
                conversation_id,
                unread_count,
            }
            | ServerEvent::UnreadCount {
                conversation_id,
                unread_count,
            } => {
                self.store
                    .write()
                    .await
                    .set_unread_count(conversation_id, unread_count);
            }
            ServerEvent::TypingStarted {
                conversation_id,
                user_id,
            } => self.on_typing(conversation_id, user_id).await,
            ServerEvent::TypingStopped {
                conversation_id,
                user_id,
            } => {
                self.store
                    .write()
                    .await
                    .remove_typing_user(conversation_id, user_id);
            }
            ServerEvent::ConversationDeleted { conversation_id } => {
                self.forget_conversation(conversation_id).await;
            }
            ServerEvent::ConversationUpdated(patch) | ServerEvent::ConversationCreated(patch) => {
                let applied = self.store.write().await.apply_conversation_patch(&patch);
                if !applied {
                    crate::log_debug!(
                        "Partial update for unknown conversation {}; refreshing list",
                        patch.conversation_id
                    );
                    let _ = self.load_conversations().await;
                }
            }
            ServerEvent::NotificationNew(notification) => {
                self.notify(ChatNotice::Notification(notification));
            }
            ServerEvent::NotificationRead { notification_id } => {
                self.notify(ChatNotice::NotificationRead(notification_id));
            }
            ServerEvent::Error { code, message } => {
                crate::log_warn!("Server error frame: {:?} {}", code, message);
                self.notify(ChatNotice::ServerError { code, message });
            }
        }
    }

    async fn on_message(&self, conversation_id: i64, mut message: Message) {
        message.conversation_id = conversation_id;
        let is_own = message.sender_id == self.user_id;
        let summary = message.summary();
        let may_recompute = self.may_recompute(conversation_id);

        let (added, known, is_open) = {
            let mut store = self.store.write().await;
            let added = store.add_message(message);
            let known = store.conversation(conversation_id).is_some();
            let newer = store
                .conversation(conversation_id)
                .and_then(|c| c.last_message_at)
                .map_or(true, |at| summary.created_at >= at);
            if added && known && newer && may_recompute {
                store.update_conversation_last_message(conversation_id, Some(summary));
            }
            let is_open = store.current_conversation_id() == Some(conversation_id);
            (added, known, is_open)
        };

        if !known {
            crate::log_debug!(
                "Message for unknown conversation {}; refreshing list",
                conversation_id
            );
            // The refreshed list carries the server's unread count.
            let _ = self.load_conversations().await;
            return;
        }
        if !added || is_own {
            return;
        }
        if is_open {
            self.mark_read(conversation_id).await;
        } else {
            self.store.write().await.increment_unread(conversation_id);
        }
    }

    async fn on_typing(&self, conversation_id: i64, user_id: i64) {
        if user_id == self.user_id {
            return;
        }
        self.store
            .write()
            .await
            .add_typing_user(conversation_id, user_id);

        let store = self.store.clone();
        let ttl = self.config.typing_ttl;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            store.write().await.clear_typing_users(conversation_id);
        });
        if let Some(previous) = lock(&self.typing_timers).insert(conversation_id, timer) {
            previous.abort();
        }
    }

    /// Stop the transport and cancel every pending typing timer.
    pub async fn shutdown(&self) {
        for (_, timer) in lock(&self.typing_timers).drain() {
            timer.abort();
        }
        self.transport.disconnect();
        self.store.write().await.clear_all_typing();
        crate::log_info!("Chat coordinator shut down");
    }
}

impl<T: Transport, A: ChatApi> Drop for Coordinator<T, A> {
    fn drop(&mut self) {
        for (_, timer) in lock(&self.typing_timers).drain() {
            timer.abort();
        }
    }
}
