//! Real-time transport for chat.
//!
//! ```text
//!   ChatSocket ──inbound ServerEvent──▶ Coordinator ──▶ ChatStore
//!       ▲                                   │
//!       └──────── Transport::send ──────────┘ (false ⇒ REST fallback)
//! ```
//!
//! [`ChatSocket`] owns the connection lifecycle: a fixed-delay reconnect loop
//! capped at five attempts, auth-rejection handling, and a `watch` channel
//! carrying the [`ConnectionState`] for the UI.

mod connection;
mod socket;

pub use connection::{
    ConnectionState, Dialer, ReconnectConfig, Transport, TungsteniteDialer, WsStream,
};
pub use socket::ChatSocket;
