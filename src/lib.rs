//! chat-relay - streaming chat-completion relay
//!
//! This library provides the core functionality for the chat-relay proxy:
//! configuration, the edge API-key gate, the pooled upstream client, and the
//! event reframer that relays upstream SSE lines to callers.

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{Error, Result};
