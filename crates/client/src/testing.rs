//! In-memory fakes for the REST and socket seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use scholaris_shared::{
    ApiError, ChatUser, ClientCommand, Conversation, CursorToken, Message, MessageType,
    PagedMessages, Recipient, UserRole,
};

use crate::api_client::{ChatApi, MediaUpload};
use crate::ws::Transport;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn message(conversation_id: i64, id: i64, sender_id: i64, secs: i64) -> Message {
    Message {
        id: Some(id),
        client_message_id: None,
        conversation_id,
        sender_id,
        body: Some(format!("m{}", id)),
        created_at: at(secs),
        kind: MessageType::Text,
        file_url: None,
    }
}

pub fn conversation(conversation_id: i64, other_user_id: i64) -> Conversation {
    Conversation {
        conversation_id,
        other_user: ChatUser {
            id: other_user_id,
            username: format!("user{}", other_user_id),
            email: None,
            role: UserRole::Teacher,
        },
        last_message: None,
        unread_count: 0,
        last_message_at: None,
    }
}

/// Transport that records commands and accepts them only while "open".
#[derive(Default)]
pub struct FakeTransport {
    open: AtomicBool,
    pub sent: Mutex<Vec<ClientCommand>>,
    pub disconnected: AtomicBool,
}

impl FakeTransport {
    pub fn open() -> Self {
        let transport = Self::default();
        transport.open.store(true, Ordering::SeqCst);
        transport
    }

    pub fn closed() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<ClientCommand> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for FakeTransport {
    fn send(&self, command: ClientCommand) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().unwrap().push(command);
        true
    }

    fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// REST fake backed by canned data. Every call is recorded by name.
#[derive(Default)]
pub struct FakeApi {
    pub calls: Mutex<Vec<String>>,
    pub conversations: Mutex<Vec<Conversation>>,
    pub recipients: Vec<Recipient>,
    /// Pages keyed by `(conversation_id, cursor)`.
    pub pages: Mutex<HashMap<(i64, Option<i64>), PagedMessages>>,
    /// When set, every call fails with this error.
    pub failure: Mutex<Option<ApiError>>,
    next_id: Mutex<i64>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1000),
            ..Default::default()
        }
    }

    pub fn failing(error: ApiError) -> Self {
        let api = Self::new();
        *api.failure.lock().unwrap() = Some(error);
        api
    }

    pub fn with_page(
        self,
        conversation_id: i64,
        cursor: Option<i64>,
        results: Vec<Message>,
        next_cursor: Option<i64>,
    ) -> Self {
        self.pages.lock().unwrap().insert(
            (conversation_id, cursor),
            PagedMessages {
                results,
                next_cursor: next_cursor.map(CursorToken::Id),
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        match self.failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn allocate_id(&self) -> i64 {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        *next
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_recipients(&self) -> Result<Vec<Recipient>, ApiError> {
        self.record("list_recipients".into())?;
        Ok(self.recipients.clone())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        self.record("list_conversations".into())?;
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn create_conversation(&self, recipient_user_id: i64) -> Result<Conversation, ApiError> {
        self.record(format!("create_conversation:{}", recipient_user_id))?;
        let mut conversations = self.conversations.lock().unwrap();
        if let Some(existing) = conversations
            .iter()
            .find(|c| c.other_user.id == recipient_user_id)
        {
            return Ok(existing.clone());
        }
        let created = conversation(recipient_user_id * 10, recipient_user_id);
        conversations.push(created.clone());
        Ok(created)
    }

    async fn list_messages(
        &self,
        conversation_id: i64,
        limit: usize,
        cursor: Option<i64>,
    ) -> Result<PagedMessages, ApiError> {
        self.record(format!(
            "list_messages:{}:{}:{:?}",
            conversation_id, limit, cursor
        ))?;
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(conversation_id, cursor))
            .cloned()
            .unwrap_or(PagedMessages {
                results: Vec::new(),
                next_cursor: None,
            }))
    }

    async fn send_message(
        &self,
        conversation_id: i64,
        body: &str,
        client_message_id: &str,
    ) -> Result<Message, ApiError> {
        self.record(format!("send_message:{}:{}", conversation_id, body))?;
        Ok(Message {
            id: Some(self.allocate_id()),
            client_message_id: Some(client_message_id.to_string()),
            conversation_id,
            sender_id: 1,
            body: Some(body.to_string()),
            created_at: Utc::now(),
            kind: MessageType::Text,
            file_url: None,
        })
    }

    async fn send_media(
        &self,
        conversation_id: i64,
        upload: MediaUpload,
    ) -> Result<Message, ApiError> {
        self.record(format!("send_media:{}:{}", conversation_id, upload.file_name))?;
        Ok(Message {
            id: Some(self.allocate_id()),
            client_message_id: Some(upload.client_message_id),
            conversation_id,
            sender_id: 1,
            body: upload.body,
            created_at: Utc::now(),
            kind: upload.kind,
            file_url: Some(format!("https://cdn.test/{}", upload.file_name)),
        })
    }

    async fn edit_message(&self, message_id: i64, body: &str) -> Result<Message, ApiError> {
        self.record(format!("edit_message:{}:{}", message_id, body))?;
        let mut edited = message(0, message_id, 1, 0);
        edited.body = Some(body.to_string());
        Ok(edited)
    }

    async fn delete_message(&self, message_id: i64) -> Result<(), ApiError> {
        self.record(format!("delete_message:{}", message_id))
    }

    async fn delete_conversation(&self, conversation_id: i64) -> Result<(), ApiError> {
        self.record(format!("delete_conversation:{}", conversation_id))
    }
}
