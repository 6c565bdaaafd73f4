//! Errors surfaced by the chat coordinator.

use scholaris_shared::ApiError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Message body is empty")]
    EmptyMessage,

    #[error("Unknown message: {0}")]
    UnknownMessage(i64),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(i64),
}
