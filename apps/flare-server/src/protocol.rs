//! Wire format: JSON objects discriminated by a `type` field, plus the close
//! reasons the server sends when it hangs up on a connection.

use std::fmt;

use axum::extract::ws::close_code;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalError;

/// Messages exchanged with clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Offerer submits its session description; relayed back to the
    /// requester in reply to a connection request.
    Offer { sdp: String },
    /// Reply to an offer carrying the freshly generated passphrase.
    Passphrase { passphrase: String },
    /// Requester asks to join the session named by the passphrase.
    ConnectionRequest { passphrase: String },
    Answer { passphrase: String, sdp: String },
    IceCandidate {
        passphrase: String,
        candidate: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Offer,
    Passphrase,
    ConnectionRequest,
    Answer,
    IceCandidate,
}

impl MessageKind {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "offer" => Some(Self::Offer),
            "passphrase" => Some(Self::Passphrase),
            "connection-request" => Some(Self::ConnectionRequest),
            "answer" => Some(Self::Answer),
            "ice-candidate" => Some(Self::IceCandidate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Passphrase => "passphrase",
            Self::ConnectionRequest => "connection-request",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }

    /// Whether clients may send this kind to the server.
    pub fn is_inbound(self) -> bool {
        !matches!(self, Self::Passphrase)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SignalingMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Offer { .. } => MessageKind::Offer,
            Self::Passphrase { .. } => MessageKind::Passphrase,
            Self::ConnectionRequest { .. } => MessageKind::ConnectionRequest,
            Self::Answer { .. } => MessageKind::Answer,
            Self::IceCandidate { .. } => MessageKind::IceCandidate,
        }
    }
}

/// A raw inbound or outbound websocket payload. Answers and candidates are
/// relayed as the exact frame the client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Decodes a client message. Malformed JSON (or a known type with missing
/// fields) is a [`SignalError::Decode`]; a missing, unknown or server-only
/// `type` is a [`SignalError::InvalidMessage`].
pub fn decode(bytes: &[u8]) -> Result<SignalingMessage, SignalError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind,
        Some(_) => return Err(SignalError::InvalidMessage("type must be a string".into())),
        None => return Err(SignalError::InvalidMessage("missing type".into())),
    };
    match MessageKind::from_wire(kind) {
        Some(kind) if kind.is_inbound() => {}
        Some(kind) => {
            return Err(SignalError::InvalidMessage(format!(
                "unexpected message type: {kind}"
            )))
        }
        None => {
            return Err(SignalError::InvalidMessage(format!(
                "unknown message type: {kind}"
            )))
        }
    }
    Ok(serde_json::from_value(value)?)
}

pub fn encode(message: &SignalingMessage) -> Result<String, SignalError> {
    Ok(serde_json::to_string(message)?)
}

/// Close status plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub detail: String,
}

impl CloseReason {
    pub fn not_acceptable(detail: impl Into<String>) -> Self {
        Self {
            code: close_code::UNSUPPORTED,
            detail: detail.into(),
        }
    }

    pub fn protocol_error(detail: impl Into<String>) -> Self {
        Self {
            code: close_code::PROTOCOL,
            detail: detail.into(),
        }
    }

    pub fn go_away(detail: impl Into<String>) -> Self {
        Self {
            code: close_code::AWAY,
            detail: detail.into(),
        }
    }

    /// Sent to the requester when the offerer goes away.
    pub fn sender_disconnected() -> Self {
        Self::go_away("sender disconnected")
    }

    /// Sent to the offerer when the requester goes away.
    pub fn receiver_disconnected() -> Self {
        Self::go_away("receiver disconnected")
    }

    pub fn offer_expired() -> Self {
        Self::go_away("offer expired")
    }

    pub fn label(&self) -> &'static str {
        match self.code {
            close_code::UNSUPPORTED => "not_acceptable",
            close_code::PROTOCOL => "protocol_error",
            close_code::AWAY => "go_away",
            _ => "other",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.detail, self.code)
    }
}
