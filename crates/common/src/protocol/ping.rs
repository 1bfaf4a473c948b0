use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of a latency check, sent once by the relay on the latency websocket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMessage {
    /// Round trip measured by the relay, in milliseconds
    pub latency_ms: i64,

    /// Whether the relay considers the latency good enough to proxy an IDE
    #[serde(default)]
    pub tolerable: bool,

    /// Non-empty when the measurement itself failed
    #[serde(default)]
    pub error: String,
}

impl PingMessage {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.max(0) as u64)
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }
}
