use thiserror::Error;

use crate::connection::ConnectionId;
use crate::protocol::CloseReason;

/// Failures of a single signaling operation. Every one of them is terminal
/// for the connection that triggered it.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("stranger connection {0} is not part of the session")]
    StrangerConnection(ConnectionId),
    #[error("failed to forward to connection {0}: peer is gone")]
    Forwarding(ConnectionId),
    #[error("passphrase generation failed: {0}")]
    EntropySource(String),
    #[error("session already paired: {0}")]
    AlreadyPaired(String),
    #[error("connection {0} already belongs to a session")]
    ConnectionBusy(ConnectionId),
}

impl SignalError {
    /// How the offending connection is closed.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            SignalError::Decode(_) => CloseReason::not_acceptable("invalid JSON"),
            SignalError::InvalidMessage(_) => CloseReason::not_acceptable("invalid message"),
            other => CloseReason::protocol_error(other.to_string()),
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            SignalError::Decode(_) => "decode",
            SignalError::InvalidMessage(_) => "invalid_message",
            SignalError::SessionNotFound(_) => "session_not_found",
            SignalError::StrangerConnection(_) => "stranger_connection",
            SignalError::Forwarding(_) => "forwarding",
            SignalError::EntropySource(_) => "entropy_source",
            SignalError::AlreadyPaired(_) => "already_paired",
            SignalError::ConnectionBusy(_) => "connection_busy",
        }
    }
}
