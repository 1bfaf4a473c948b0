use std::io;

use relay_agent_common::AgentError;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{error, warn};

use crate::ws::{CloseError, is_benign_close_code};

/// Log level for a failure that was absorbed rather than propagated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Expected ways for a link or session to end
    Warn,
    Error,
}

/// Classify an error by how alarming it is
///
/// Cancellation, clean end-of-stream, an already-closed websocket and close
/// codes 1000/1001/1005 are routine; everything else is an error.
pub fn severity(err: &AgentError) -> Severity {
    let benign = err.is_cancelled()
        || err.is_clean_close()
        || err.any_cause(|cause| {
            if let Some(ws) = cause.downcast_ref::<WsError>() {
                return matches!(ws, WsError::ConnectionClosed | WsError::AlreadyClosed);
            }
            if let Some(close) = cause.downcast_ref::<CloseError>() {
                return is_benign_close_code(close.code);
            }
            cause
                .downcast_ref::<io::Error>()
                .is_some_and(|e| e.kind() == io::ErrorKind::UnexpectedEof)
        });

    if benign { Severity::Warn } else { Severity::Error }
}

/// Log `err` at the level chosen by [`severity`]
pub fn log_failure(err: &AgentError, what: &str) {
    match severity(err) {
        Severity::Warn => warn!(error = %err, "{} ended", what),
        Severity::Error => error!(error = %err, "{} failed", what),
    }
}
