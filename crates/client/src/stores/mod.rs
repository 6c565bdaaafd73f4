//! Client-side chat state.

pub mod chat;

pub use chat::{ChatStore, SharedStore};
