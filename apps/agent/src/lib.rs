//! Relay agent
//!
//! Exposes a local development server to a relay using only outbound
//! connections. The agent keeps a small pool of tunnel links dialed to the
//! relay; each link that receives traffic is spliced to a loopback reverse
//! proxy which forwards to the local service, optionally with an auth cookie.

pub mod agent;
pub mod bridge;
pub mod client;
pub mod config;
pub mod login;
pub mod pool;
pub mod severity;
pub mod store;
pub mod upstream;
pub mod ws;

pub use agent::Agent;
pub use bridge::bridge;
pub use client::{ApiClient, ping};
pub use config::AgentConfig;
pub use login::login;
pub use pool::{LinkDialer, RelayDialer, TunnelPool};
pub use store::{ConfigKey, CredentialStore};
pub use upstream::UpstreamProxy;
pub use ws::WsByteStream;

/// Version reported to the relay
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `User-Agent` sent on REST calls and tunnel dials
pub fn user_agent() -> String {
    format!("relay-agent/{}", AGENT_VERSION)
}
