use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Users ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Student,
    Teacher,
    Admin,
    #[serde(other)]
    Unknown,
}

impl Default for UserRole {
    fn default() -> Self {
        UserRole::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatUser {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: UserRole,
}

/// Someone the current user is allowed to open a conversation with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipient {
    #[serde(flatten)]
    pub user: ChatUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

// --- Messages ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::File => "file",
        }
    }

    pub fn is_media(&self) -> bool {
        !matches!(self, MessageType::Text)
    }
}

/// De-duplication key of a message inside its conversation.
///
/// The server id wins once assigned; until then the client-generated id
/// identifies the pending entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Id(i64),
    Client(String),
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKey::Id(id) => write!(f, "#{}", id),
            MessageKey::Client(cid) => write!(f, "client:{}", cid),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Server-assigned id, absent while the message is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
    #[serde(default)]
    pub conversation_id: i64,
    pub sender_id: i64,
    #[serde(default)]
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

impl Message {
    /// A locally created text message that has not been persisted yet.
    pub fn pending(
        conversation_id: i64,
        sender_id: i64,
        body: impl Into<String>,
        client_message_id: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            client_message_id: Some(client_message_id.into()),
            conversation_id,
            sender_id,
            body: Some(body.into()),
            created_at: Utc::now(),
            kind: MessageType::Text,
            file_url: None,
        }
    }

    pub fn key(&self) -> Option<MessageKey> {
        match (self.id, self.client_message_id.as_ref()) {
            (Some(id), _) => Some(MessageKey::Id(id)),
            (None, Some(cid)) => Some(MessageKey::Client(cid.clone())),
            (None, None) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }

    pub fn summary(&self) -> LastMessage {
        LastMessage {
            id: self.id,
            body: self.body.clone(),
            sender_id: self.sender_id,
            created_at: self.created_at,
            kind: self.kind,
        }
    }
}

// --- Conversations ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastMessage {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub body: Option<String>,
    pub sender_id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub conversation_id: i64,
    pub other_user: ChatUser,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Sort key for the conversation list; a missing timestamp sorts as the epoch.
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Overlay the fields present in `patch`.
    pub fn apply(&mut self, patch: &ConversationPatch) {
        if let Some(user) = &patch.other_user {
            self.other_user = user.clone();
        }
        if let Some(last) = &patch.last_message {
            self.last_message = Some(last.clone());
            if patch.last_message_at.is_none() {
                self.last_message_at = Some(last.created_at);
            }
        }
        if let Some(count) = patch.unread_count {
            self.unread_count = count;
        }
        if let Some(at) = patch.last_message_at {
            self.last_message_at = Some(at);
        }
    }
}

/// Conversation payload where every field but the id may be missing.
///
/// `conversation.updated` and `conversation.new` frames carry either a full
/// conversation or just the fields that changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationPatch {
    pub conversation_id: i64,
    #[serde(default)]
    pub other_user: Option<ChatUser>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: Option<u32>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ConversationPatch {
    /// Full conversation, if the patch carries enough to build one.
    pub fn to_conversation(&self) -> Option<Conversation> {
        let other_user = self.other_user.clone()?;
        Some(Conversation {
            conversation_id: self.conversation_id,
            other_user,
            last_message: self.last_message.clone(),
            unread_count: self.unread_count.unwrap_or(0),
            last_message_at: self
                .last_message_at
                .or_else(|| self.last_message.as_ref().map(|m| m.created_at)),
        })
    }
}

impl From<Conversation> for ConversationPatch {
    fn from(c: Conversation) -> Self {
        Self {
            conversation_id: c.conversation_id,
            other_user: Some(c.other_user),
            last_message: c.last_message,
            unread_count: Some(c.unread_count),
            last_message_at: c.last_message_at,
        }
    }
}

// --- Pagination ---

/// Server pagination token. Only its presence matters to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CursorToken {
    Id(i64),
    Opaque(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PagedMessages {
    pub results: Vec<Message>,
    #[serde(default)]
    pub next_cursor: Option<CursorToken>,
}

// --- Requests ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateConversationRequest {
    pub recipient_user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessageRequest {
    pub body: String,
    pub client_message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditMessageRequest {
    pub body: String,
}

// --- Notifications ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
}
