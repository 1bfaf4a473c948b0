use std::fmt;

use relay_agent_common::constants::{DEFAULT_UPSTREAM_ADDR, WARM_POOL_SIZE};
use url::Url;

/// Configuration for one proxy session
///
/// Built once from the credential store and CLI flags, then shared read-only.
#[derive(Clone)]
pub struct AgentConfig {
    /// Relay base URL (e.g., "https://relay.example.com")
    pub relay_url: Url,

    /// Identity of the registered server the tunnels belong to
    pub server_id: String,

    /// Session credential sent on every tunnel dial
    pub session_token: String,

    /// Local development server (host:port)
    pub upstream_addr: String,

    /// Shared secret turned into the `key` cookie, if the local service wants one
    pub upstream_secret: Option<String>,

    /// Number of tunnel links kept dialed at once
    pub pool_size: usize,
}

impl AgentConfig {
    pub fn new(relay_url: Url, server_id: impl Into<String>, session_token: impl Into<String>) -> Self {
        Self {
            relay_url,
            server_id: server_id.into(),
            session_token: session_token.into(),
            upstream_addr: DEFAULT_UPSTREAM_ADDR.to_string(),
            upstream_secret: None,
            pool_size: WARM_POOL_SIZE,
        }
    }

    pub fn with_upstream(mut self, addr: impl Into<String>) -> Self {
        self.upstream_addr = addr.into();
        self
    }

    /// Empty secrets are treated as no secret
    pub fn with_upstream_secret(mut self, secret: Option<String>) -> Self {
        self.upstream_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("relay_url", &self.relay_url.as_str())
            .field("server_id", &self.server_id)
            .field("session_token", &"<redacted>")
            .field("upstream_addr", &self.upstream_addr)
            .field(
                "upstream_secret",
                &self.upstream_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("pool_size", &self.pool_size)
            .finish()
    }
}
