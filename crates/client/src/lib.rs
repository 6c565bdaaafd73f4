//! Scholaris Client - chat core
//!
//! Everything the chat UI needs below the presentation layer: the REST
//! client, the reconnecting socket transport, the conversation/message
//! store, the coordinator reconciling the two sources, and the pagination
//! controller. No UI framework is involved; hosts drive it through the
//! public types re-exported here.

pub mod logging;

pub mod api_client;
pub mod auth_session;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pagination;
pub mod storage;
pub mod stores;
pub mod ws;

#[cfg(test)]
mod testing;

pub use api_client::{ApiClient, ChatApi, MediaUpload};
pub use auth_session::{clear_session, load_session, save_session, AuthSession};
pub use config::ChatConfig;
pub use coordinator::{new_client_message_id, ChatNotice, Coordinator};
pub use error::ChatError;
pub use pagination::{PaginationController, ScrollAnchor, ScrollMetrics};
pub use storage::Storage;
pub use stores::{ChatStore, SharedStore};
pub use ws::{ChatSocket, ConnectionState, ReconnectConfig, Transport};
