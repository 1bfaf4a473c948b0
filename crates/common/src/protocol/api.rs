use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// A server registered with the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub user_id: String,

    /// Name chosen at registration, unique per user
    pub name: String,

    /// Hostname of the machine the agent ran on when registering
    pub hostname: String,

    pub created_at: DateTime<Utc>,
    pub last_connection_at: DateTime<Utc>,
}

/// The user owning the session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Browser-facing URL of a registered server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessUrlResponse {
    pub url: String,
}

/// Body of `POST /api/servers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterServerRequest {
    pub name: String,
    pub hostname: String,
}

impl RegisterServerRequest {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
        }
    }
}

/// Error envelope returned by the relay on any non-success status
///
/// ```json
/// {"error": {"msg": "server name already taken"}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub msg: String,
}

impl ApiErrorBody {
    /// Decode an error body, returning `None` if it is not an error envelope
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }

    pub fn message(&self) -> &str {
        &self.error.msg
    }

    /// Error for a non-success response: the relay's message verbatim, or
    /// the status when the body is not an error envelope
    pub fn error_for_status(status: u16, body: &[u8]) -> AgentError {
        match Self::parse(body) {
            Some(parsed) => AgentError::upstream(parsed.error.msg),
            None => AgentError::upstream(format!("unexpected status code {}", status)),
        }
    }
}
