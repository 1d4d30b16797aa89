//! Transport-facing handle for one upgraded connection. The core only sees
//! the stable [`ConnectionId`] and a non-blocking outbound queue; the
//! websocket writer task owns the socket itself.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::error::SignalError;
use crate::protocol::{self, CloseReason, Frame, SignalingMessage};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    Close(CloseReason),
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a frame for the writer. Fails once the writer has gone away.
    pub fn send(&self, frame: Frame) -> Result<(), SignalError> {
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| SignalError::Forwarding(self.id))
    }

    pub fn send_message(&self, message: &SignalingMessage) -> Result<(), SignalError> {
        let text = protocol::encode(message)?;
        self.send(Frame::Text(text))
    }

    /// Best effort: closing an already-closed connection is a no-op.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.tx.send(Outbound::Close(reason));
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test_timeout::timeout]
    fn frames_and_close_are_queued_in_order() {
        let (handle, mut rx) = ConnectionHandle::new(ConnectionId::from_raw(1));
        handle
            .send_message(&SignalingMessage::Passphrase {
                passphrase: "alpha".into(),
            })
            .unwrap();
        handle.close(CloseReason::sender_disconnected());

        match rx.try_recv().unwrap() {
            Outbound::Frame(Frame::Text(text)) => {
                assert_eq!(text, r#"{"type":"passphrase","passphrase":"alpha"}"#)
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close(CloseReason::sender_disconnected())
        );
    }

    #[test_timeout::timeout]
    fn send_after_writer_dropped_is_a_forwarding_error() {
        let (handle, rx) = ConnectionHandle::new(ConnectionId::from_raw(4));
        drop(rx);
        let err = handle.send(Frame::Text("x".into())).unwrap_err();
        assert!(matches!(err, SignalError::Forwarding(id) if id == handle.id()));
        handle.close(CloseReason::protocol_error("ignored"));
    }
}
