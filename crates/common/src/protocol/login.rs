use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Messages exchanged on the login websocket
///
/// A relay sends any number of `AuthUrl` messages followed by exactly one
/// terminal `Token` or `Error`. On the wire each message is a JSON text frame
/// of the form `{"type":"auth_url","msg":"https://..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "msg", rename_all = "snake_case")]
pub enum LoginMessage {
    /// URL the user must visit to authorize the agent
    AuthUrl(String),

    /// Session credential issued after a successful login
    Token(String),

    /// Terminal failure reported by the relay
    Error(String),
}

/// Only used to name the type of a message we could not decode
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

impl LoginMessage {
    pub const AUTH_URL: &'static str = "auth_url";
    pub const TOKEN: &'static str = "token";
    pub const ERROR: &'static str = "error";

    /// Wire name of this message's type
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::AuthUrl(_) => Self::AUTH_URL,
            Self::Token(_) => Self::TOKEN,
            Self::Error(_) => Self::ERROR,
        }
    }

    /// Decode one text frame, reporting unknown types as protocol violations
    pub fn decode(text: &str) -> Result<Self> {
        match serde_json::from_str::<Self>(text) {
            Ok(message) => Ok(message),
            Err(err) => match serde_json::from_str::<Envelope>(text) {
                Ok(envelope)
                    if ![Self::AUTH_URL, Self::TOKEN, Self::ERROR]
                        .contains(&envelope.kind.as_str()) =>
                {
                    Err(AgentError::protocol(format!(
                        "unexpected message type {}",
                        envelope.kind
                    )))
                }
                _ => Err(AgentError::protocol(format!(
                    "malformed login message: {}",
                    err
                ))),
            },
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
