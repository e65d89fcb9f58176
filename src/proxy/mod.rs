//! HTTP proxy server module.
//!
//! This module provides the chat-completions endpoint that admits callers,
//! forwards their payload upstream, and relays the streamed reply.

pub mod auth;
mod handlers;
mod server;
pub mod stream;
pub mod types;
pub mod upstream;

pub use auth::{AuthGate, Authorized};
pub use server::{create_router, run_server, AppState, RequestId, REQUEST_ID_HEADER};
pub use stream::{reframe, relay, Reframed, SkipReason};
pub use types::ChatPayload;
pub use upstream::{LineBuffer, UpstreamClient, UpstreamLines};
