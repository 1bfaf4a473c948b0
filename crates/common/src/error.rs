use std::error::Error as StdError;
use std::fmt;
use std::io;

use thiserror::Error;

/// Boxed cause attached to fatal and recoverable errors
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Classification of an [`AgentError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Ends the proxy session; surfaced to the caller for a restart
    Fatal,
    /// Confined to one link or one attempt; logged and absorbed
    Recoverable,
    /// Unexpected message type or sequence in the login handshake
    ProtocolViolation,
    /// Failure message supplied by the relay, kept verbatim
    UpstreamReported,
}

/// Error types for the relay agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("{}", describe(.message, .cause))]
    Fatal {
        message: String,
        cause: Option<BoxError>,
    },

    #[error("{}", describe(.message, .cause))]
    Recoverable {
        message: String,
        cause: Option<BoxError>,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{0}")]
    UpstreamReported(String),
}

/// Type alias for Results using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;

/// Marker cause for work abandoned because its cancellation token fired
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

fn describe(message: &str, cause: &Option<BoxError>) -> String {
    match cause {
        Some(cause) => format!("{}: {}", message, cause),
        None => message.to_string(),
    }
}

impl AgentError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            cause: None,
        }
    }

    pub fn fatal_with(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Fatal {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable {
            message: message.into(),
            cause: None,
        }
    }

    pub fn recoverable_with(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Recoverable {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamReported(message.into())
    }

    /// A fatal error caused by cancellation of the controlling token
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::fatal_with(message, Cancelled)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fatal { .. } => ErrorKind::Fatal,
            Self::Recoverable { .. } => ErrorKind::Recoverable,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::UpstreamReported(_) => ErrorKind::UpstreamReported,
        }
    }

    /// The human-readable reason without the attached cause
    pub fn message(&self) -> &str {
        match self {
            Self::Fatal { message, .. } | Self::Recoverable { message, .. } => message,
            Self::ProtocolViolation(message) | Self::UpstreamReported(message) => message,
        }
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Fatal { cause, .. } | Self::Recoverable { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// Prefix the message with `context`, keeping kind and cause
    pub fn context(self, context: impl fmt::Display) -> Self {
        match self {
            Self::Fatal { message, cause } => Self::Fatal {
                message: format!("{}: {}", context, message),
                cause,
            },
            Self::Recoverable { message, cause } => Self::Recoverable {
                message: format!("{}: {}", context, message),
                cause,
            },
            Self::ProtocolViolation(message) => {
                Self::ProtocolViolation(format!("{}: {}", context, message))
            }
            Self::UpstreamReported(message) => {
                Self::UpstreamReported(format!("{}: {}", context, message))
            }
        }
    }

    /// Walk the cause chain, looking inside `io::Error` wrappers as well
    pub fn any_cause(&self, mut predicate: impl FnMut(&(dyn StdError + 'static)) -> bool) -> bool {
        let mut next = self.cause().map(|cause| cause as &(dyn StdError + 'static));

        while let Some(err) = next {
            if predicate(err) {
                return true;
            }
            // io::Error::source skips the wrapped error, so look at it directly
            if let Some(io_err) = err.downcast_ref::<io::Error>()
                && let Some(inner) = io_err.get_ref()
            {
                let inner: &(dyn StdError + 'static) = inner;
                if predicate(inner) {
                    return true;
                }
                next = inner.source();
                continue;
            }
            next = err.source();
        }

        false
    }

    pub fn is_cancelled(&self) -> bool {
        self.any_cause(|err| err.is::<Cancelled>())
    }

    /// True when the session ended by a clean end-of-stream
    pub fn is_clean_close(&self) -> bool {
        self.any_cause(|err| {
            err.downcast_ref::<io::Error>()
                .is_some_and(|io_err| io_err.kind() == io::ErrorKind::UnexpectedEof)
        })
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        Self::recoverable_with("decode json", err)
    }
}
