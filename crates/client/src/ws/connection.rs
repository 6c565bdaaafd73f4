//! Connection state, reconnect policy and the outbound send surface.

use async_trait::async_trait;
use scholaris_shared::ClientCommand;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state for the chat socket
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Gave up: retries exhausted or credentials rejected. Only a new
    /// `connect` (e.g. after re-login) leaves this state.
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed { .. }
        )
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff (1.0 = fixed delay)
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 3000,
            max_delay_ms: 3000,
            backoff_multiplier: 1.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(attempt as i32);
        (delay as u32).min(self.max_delay_ms)
    }

    /// Whether `attempts` reconnects already made use up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

/// Opens socket streams. Swappable so the reconnect loop can be driven in tests.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<WsStream, tungstenite::Error>;
}

/// Production dialer backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteDialer;

#[async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(&self, url: &str) -> Result<WsStream, tungstenite::Error> {
        let (stream, _response) = connect_async(url).await?;
        Ok(stream)
    }
}

/// Outbound half of the transport as seen by the coordinator.
///
/// Every operation returns whether the frame was accepted by an open socket.
/// `false` means "use the REST fallback", never a hard failure.
pub trait Transport: Send + Sync {
    fn send(&self, command: ClientCommand) -> bool;

    /// Stop the connection and any pending reconnect.
    fn disconnect(&self);

    fn send_message(&self, conversation_id: i64, body: &str, client_message_id: &str) -> bool {
        self.send(ClientCommand::MessageSend {
            conversation_id,
            body: body.to_string(),
            client_message_id: client_message_id.to_string(),
        })
    }

    fn send_typing(&self, conversation_id: i64) -> bool {
        self.send(ClientCommand::Typing { conversation_id })
    }

    fn mark_as_read(&self, conversation_id: i64) -> bool {
        self.send(ClientCommand::MessageRead { conversation_id })
    }

    fn edit_message(&self, message_id: i64, body: &str) -> bool {
        self.send(ClientCommand::MessageEdit {
            message_id,
            body: body.to_string(),
        })
    }

    fn delete_message(&self, message_id: i64) -> bool {
        self.send(ClientCommand::MessageDelete { message_id })
    }

    fn delete_conversation(&self, conversation_id: i64) -> bool {
        self.send(ClientCommand::ConversationDelete { conversation_id })
    }
}
