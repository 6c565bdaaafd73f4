//! Client configuration from environment variables.

use std::time::Duration;

use crate::ws::ReconnectConfig;

/// Tunables for the chat core. Defaults match the production web client.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Host used when the session has no tenant domain (e.g. "localhost:8000").
    pub default_host: String,
    /// Path prefix of the REST API on every host.
    pub api_path: String,
    /// Path of the chat socket endpoint.
    pub ws_path: String,
    pub reconnect: ReconnectConfig,
    /// How long a typing indicator survives without a refreshing signal.
    pub typing_ttl: Duration,
    /// How long after a local send the coordinator leaves `last_message` to the server.
    pub last_message_suppression: Duration,
    /// Messages requested per page.
    pub page_size: usize,
    /// Distance from the top (px) at which older messages are requested.
    pub load_older_threshold: f64,
    /// Distance from the bottom (px) within which new arrivals auto-scroll.
    pub stick_to_bottom_threshold: f64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_host: "localhost:8000".to_string(),
            api_path: "/api".to_string(),
            ws_path: "/ws/chat/".to_string(),
            reconnect: ReconnectConfig::default(),
            typing_ttl: Duration::from_secs(3),
            last_message_suppression: Duration::from_secs(2),
            page_size: 30,
            load_older_threshold: 100.0,
            stick_to_bottom_threshold: 200.0,
        }
    }
}

impl ChatConfig {
    /// Build a configuration from the environment.
    ///
    /// Environment variables:
    /// - `SCHOLARIS_DEFAULT_HOST`: host used without a tenant (default: "localhost:8000")
    /// - `SCHOLARIS_API_PATH`: REST prefix (default: "/api")
    /// - `SCHOLARIS_WS_PATH`: socket path (default: "/ws/chat/")
    /// - `SCHOLARIS_PAGE_SIZE`: messages per page (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let default_host =
            std::env::var("SCHOLARIS_DEFAULT_HOST").unwrap_or(defaults.default_host);
        let api_path = std::env::var("SCHOLARIS_API_PATH").unwrap_or(defaults.api_path);
        let ws_path = std::env::var("SCHOLARIS_WS_PATH").unwrap_or(defaults.ws_path);
        let page_size = std::env::var("SCHOLARIS_PAGE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.page_size);

        Self {
            default_host,
            api_path: normalize_path(&api_path),
            ws_path: normalize_path(&ws_path),
            page_size,
            ..defaults
        }
    }
}

/// Ensure a leading slash; keep any trailing one as given.
fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.typing_ttl, Duration::from_secs(3));
        assert_eq!(config.last_message_suppression, Duration::from_secs(2));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.delay_for_attempt(4), 3000);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("api"), "/api");
        assert_eq!(normalize_path("/ws/chat/"), "/ws/chat/");
    }
}
