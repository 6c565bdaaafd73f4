//! Shared error types.

use serde_json::Value;
use thiserror::Error;

/// Error returned by REST calls against the chat API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Http { status: 401 | 403, .. })
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Http { status, body } => problem_detail(body)
                .unwrap_or_else(|| format!("Request failed with status {}", status)),
            ApiError::Network(_) => "Could not reach the server".to_string(),
            ApiError::Deserialize(_) => "Unexpected response from the server".to_string(),
        }
    }
}

/// Pull a human-readable message out of an error body.
/// Prefers `detail`, then `message`, then `error`.
pub fn problem_detail(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    ["detail", "message", "error"].iter().find_map(|key| {
        parsed
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}
