//! Shared types for the scholaris chat client: wire models, socket frames and errors.

pub mod models;
pub mod protocol;
pub mod error;

pub use models::*;
pub use protocol::*;
pub use error::*;
