//! Chat socket frames.
//!
//! Outbound frames are plain serde structs tagged by `type`. Inbound frames are
//! decoded by hand: the server's event taxonomy is not closed, so decoding goes
//! through a fixed lookup table keyed by the lower-cased `type`, with one
//! compatibility fallback for conversation-update shaped payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ConversationPatch, Message, Notification};

/// Frames the client writes to the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "message.send")]
    MessageSend {
        conversation_id: i64,
        body: String,
        client_message_id: String,
    },
    #[serde(rename = "message.edit")]
    MessageEdit { message_id: i64, body: String },
    #[serde(rename = "message.delete")]
    MessageDelete { message_id: i64 },
    #[serde(rename = "message.read")]
    MessageRead { conversation_id: i64 },
    #[serde(rename = "typing")]
    Typing { conversation_id: i64 },
    #[serde(rename = "conversation.delete")]
    ConversationDelete { conversation_id: i64 },
}

/// Events decoded from inbound frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    MessageNew {
        conversation_id: i64,
        message: Message,
    },
    MessageEdited {
        message_id: i64,
        body: String,
    },
    MessageDeleted {
        message_id: i64,
    },
    MessageRead {
        conversation_id: i64,
        unread_count: u32,
    },
    UnreadCount {
        conversation_id: i64,
        unread_count: u32,
    },
    TypingStarted {
        conversation_id: i64,
        user_id: i64,
    },
    TypingStopped {
        conversation_id: i64,
        user_id: i64,
    },
    ConversationDeleted {
        conversation_id: i64,
    },
    ConversationUpdated(ConversationPatch),
    ConversationCreated(ConversationPatch),
    NotificationNew(Notification),
    NotificationRead {
        notification_id: i64,
    },
    Error {
        code: Option<String>,
        message: String,
    },
}

/// How an inbound frame was recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The `type` matched the dispatch table.
    Table,
    /// Unknown `type`, accepted by [`looks_like_conversation_update`].
    ConversationHeuristic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Lower-cased `type` as received (empty when the frame had none).
    pub kind: String,
    pub event: ServerEvent,
    pub classification: Classification,
}

#[derive(Deserialize)]
struct MessageNewPayload {
    conversation_id: Option<i64>,
    message: Message,
}

#[derive(Deserialize)]
struct MessageEditPayload {
    message_id: i64,
    #[serde(default)]
    body: String,
}

#[derive(Deserialize)]
struct MessageIdPayload {
    message_id: i64,
}

#[derive(Deserialize)]
struct UnreadPayload {
    conversation_id: i64,
    #[serde(default)]
    unread_count: u32,
}

#[derive(Deserialize)]
struct TypingPayload {
    conversation_id: i64,
    user_id: i64,
}

#[derive(Deserialize)]
struct ConversationIdPayload {
    conversation_id: i64,
}

#[derive(Deserialize)]
struct NotificationPayload {
    notification: Notification,
}

#[derive(Deserialize)]
struct NotificationReadPayload {
    notification_id: i64,
}

fn payload<T: DeserializeOwned>(value: &Value) -> Option<T> {
    T::deserialize(value).ok()
}

/// Conversation payloads arrive either nested under `conversation` or inline.
fn conversation_patch(value: &Value) -> Option<ConversationPatch> {
    match value.get("conversation") {
        Some(nested) if nested.is_object() => payload(nested),
        _ => payload(value),
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match value.get(*k)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Compatibility shim for conversation updates the dispatch table does not name.
///
/// Matches when the type mentions both "conversation" and "update", or when
/// the payload carries `conversation_id` alongside `last_message` or
/// `unread_count`.
pub fn looks_like_conversation_update(kind: &str, value: &Value) -> bool {
    let kind = kind.to_lowercase();
    if kind.contains("conversation") && kind.contains("update") {
        return true;
    }
    let carries_id = value.get("conversation_id").is_some_and(|v| !v.is_null());
    carries_id && (value.get("last_message").is_some() || value.get("unread_count").is_some())
}

impl ServerEvent {
    /// Parse one text frame. Malformed or unrecognised frames yield `None`.
    pub fn decode(text: &str) -> Option<DecodedFrame> {
        let value: Value = serde_json::from_str(text).ok()?;
        Self::decode_value(&value)
    }

    pub fn decode_value(value: &Value) -> Option<DecodedFrame> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();

        if let Some(event) = Self::from_table(&kind, value) {
            return Some(DecodedFrame {
                kind,
                event,
                classification: Classification::Table,
            });
        }

        if looks_like_conversation_update(&kind, value) {
            let patch = conversation_patch(value)?;
            return Some(DecodedFrame {
                kind,
                event: ServerEvent::ConversationUpdated(patch),
                classification: Classification::ConversationHeuristic,
            });
        }

        None
    }

    fn from_table(kind: &str, value: &Value) -> Option<ServerEvent> {
        let event = match kind {
            "message.new" => {
                let p: MessageNewPayload = payload(value)?;
                let mut message = p.message;
                let conversation_id = p.conversation_id.unwrap_or(message.conversation_id);
                message.conversation_id = conversation_id;
                ServerEvent::MessageNew {
                    conversation_id,
                    message,
                }
            }
            "message.edit" | "message.update" => {
                let p: MessageEditPayload = payload(value)?;
                ServerEvent::MessageEdited {
                    message_id: p.message_id,
                    body: p.body,
                }
            }
            "message.delete" => {
                let p: MessageIdPayload = payload(value)?;
                ServerEvent::MessageDeleted {
                    message_id: p.message_id,
                }
            }
            "message.read" => {
                let p: UnreadPayload = payload(value)?;
                ServerEvent::MessageRead {
                    conversation_id: p.conversation_id,
                    unread_count: p.unread_count,
                }
            }
            "unread_count.update" => {
                let p: UnreadPayload = payload(value)?;
                ServerEvent::UnreadCount {
                    conversation_id: p.conversation_id,
                    unread_count: p.unread_count,
                }
            }
            "typing" | "typing.start" => {
                let p: TypingPayload = payload(value)?;
                ServerEvent::TypingStarted {
                    conversation_id: p.conversation_id,
                    user_id: p.user_id,
                }
            }
            "typing.stop" => {
                let p: TypingPayload = payload(value)?;
                ServerEvent::TypingStopped {
                    conversation_id: p.conversation_id,
                    user_id: p.user_id,
                }
            }
            "conversation.delete" => {
                let p: ConversationIdPayload = payload(value)?;
                ServerEvent::ConversationDeleted {
                    conversation_id: p.conversation_id,
                }
            }
            "conversation.updated" => ServerEvent::ConversationUpdated(conversation_patch(value)?),
            "conversation.new" => ServerEvent::ConversationCreated(conversation_patch(value)?),
            "notification.new" => {
                let p: NotificationPayload = payload(value)?;
                ServerEvent::NotificationNew(p.notification)
            }
            "notification.read" => {
                let p: NotificationReadPayload = payload(value)?;
                ServerEvent::NotificationRead {
                    notification_id: p.notification_id,
                }
            }
            "error" => ServerEvent::Error {
                code: string_field(value, &["code", "error_code"]),
                message: string_field(value, &["message", "error", "detail"])
                    .unwrap_or_else(|| "Unknown error".to_string()),
            },
            _ => return None,
        };
        Some(event)
    }

    /// Error frames that mean the socket credentials were rejected.
    pub fn is_auth_failure(&self) -> bool {
        let ServerEvent::Error { code, message } = self else {
            return false;
        };
        let code = code.as_deref().unwrap_or_default().to_lowercase();
        let message = message.to_lowercase();
        let markers = ["auth", "token", "unauthorized"];
        code == "401"
            || code == "4001"
            || markers
                .iter()
                .any(|m| code.contains(m) || message.contains(m))
    }
}
