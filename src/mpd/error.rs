//! Error taxonomy for the MPD protocol layer.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Decoded `ACK [code@index] {command} message` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckError {
    pub code: u32,
    /// Position of the failing command inside a command list (0 outside lists)
    pub index: usize,
    pub command: String,
    pub message: String,
}

impl fmt::Display for AckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.command.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.command, self.message)
        }
    }
}

impl std::error::Error for AckError {}

/// Errors returned by [`Connection`](super::Connection), [`Client`](super::Client)
/// and [`Watcher`](super::Watcher).
#[derive(Debug, Error)]
pub enum MpdError {
    /// The owning component was closed; no further commands are accepted.
    #[error("connection closed")]
    Closed,

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The server sent something that doesn't fit the protocol framing.
    #[error("unexpected response: {0}")]
    Unexpected(String),

    #[error("protocol error: {0}")]
    Ack(#[from] AckError),
}

impl MpdError {
    /// Transport failures invalidate the socket and feed the reconnect loop.
    /// Protocol errors (ACK) leave the connection usable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MpdError::Io(_) | MpdError::Timeout(..) | MpdError::Unexpected(_)
        )
    }

    pub fn ack(&self) -> Option<&AckError> {
        match self {
            MpdError::Ack(ack) => Some(ack),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MpdError>;
