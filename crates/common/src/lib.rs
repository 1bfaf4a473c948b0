//! Common types and helpers for the relay agent
//!
//! This crate holds the wire contract shared with the relay (login messages,
//! REST payloads, latency check), the agent error type, and small helpers that
//! do not depend on the async runtime.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod utils;
pub mod validation;

// Re-export commonly used types for convenience
pub use error::{AgentError, BoxError, Cancelled, ErrorKind, Result};
pub use protocol::{
    AccessUrlResponse, ApiErrorBody, LoginMessage, PingMessage, RegisterServerRequest, Server,
    User,
};
pub use utils::{
    append_cookie, auth_cookie_value, generate_link_id, is_upgrade_request, latency_url,
    login_url, remove_hop_headers, tunnel_url,
};
