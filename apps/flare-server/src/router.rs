//! Decodes inbound frames and dispatches them to the offer, connection
//! request, answer and candidate handlers.

use metrics::counter;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::error::SignalError;
use crate::protocol::{self, Frame, SignalingMessage};
use crate::registry::{Attachment, CandidateRoute, SessionRegistry};

#[derive(Clone)]
pub struct SignalingRouter {
    registry: SessionRegistry,
}

impl SignalingRouter {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Handles one inbound frame. On failure the connection has already been
    /// told to close and the caller should stop reading from it.
    pub fn handle_frame(&self, conn: &ConnectionHandle, frame: Frame) -> Result<(), SignalError> {
        let result = self.dispatch(conn, frame);
        if let Err(err) = &result {
            let reason = err.close_reason();
            warn!(
                connection_id = %conn.id(),
                error = %err,
                close_code = reason.code,
                "closing connection after signaling error"
            );
            counter!("flare_signaling_errors_total", 1, "error" => err.metric_label());
            counter!("flare_connections_closed_total", 1, "reason" => reason.label());
            conn.close(reason);
        }
        result
    }

    fn dispatch(&self, conn: &ConnectionHandle, frame: Frame) -> Result<(), SignalError> {
        let message = protocol::decode(frame.as_bytes())?;
        let kind = message.kind();
        debug!(connection_id = %conn.id(), kind = %kind, bytes = frame.len(), "signaling message");
        counter!("flare_messages_received_total", 1, "kind" => kind.as_str());

        match message {
            SignalingMessage::Offer { sdp } => self.handle_offer(conn, sdp),
            SignalingMessage::ConnectionRequest { passphrase } => {
                self.handle_connection_request(conn, &passphrase)
            }
            SignalingMessage::Answer { passphrase, .. } => {
                self.handle_answer(conn, &passphrase, frame)
            }
            SignalingMessage::IceCandidate {
                passphrase,
                candidate,
            } => self.handle_ice_candidate(conn, &passphrase, &candidate, frame),
            SignalingMessage::Passphrase { .. } => Err(SignalError::InvalidMessage(
                "unexpected message type: passphrase".into(),
            )),
        }
    }

    fn handle_offer(&self, conn: &ConnectionHandle, sdp: String) -> Result<(), SignalError> {
        let passphrase = self.registry.create_session(conn, sdp)?;
        conn.send_message(&SignalingMessage::Passphrase { passphrase })
    }

    fn handle_connection_request(
        &self,
        conn: &ConnectionHandle,
        passphrase: &str,
    ) -> Result<(), SignalError> {
        self.registry
            .attach_requester_with(passphrase, conn, |attachment| {
                deliver_attachment(conn, attachment)
            })?;
        Ok(())
    }

    fn handle_answer(
        &self,
        conn: &ConnectionHandle,
        passphrase: &str,
        frame: Frame,
    ) -> Result<(), SignalError> {
        let offerer = self.registry.forward_answer(passphrase)?;
        self.relay(&offerer, passphrase, frame, "answer")?;
        debug!(from = %conn.id(), to = %offerer.id(), "answer relayed");
        Ok(())
    }

    fn handle_ice_candidate(
        &self,
        conn: &ConnectionHandle,
        passphrase: &str,
        candidate: &str,
        frame: Frame,
    ) -> Result<(), SignalError> {
        match self
            .registry
            .add_or_forward_candidate(passphrase, conn.id(), candidate)?
        {
            CandidateRoute::Buffered => {
                debug!(connection_id = %conn.id(), "candidate buffered until a requester attaches");
                Ok(())
            }
            CandidateRoute::Forward(target) => self.relay(&target, passphrase, frame, "ice-candidate"),
        }
    }

    /// Pass-through forward of the frame the client sent. A peer that can no
    /// longer be written to ends the session.
    fn relay(
        &self,
        target: &ConnectionHandle,
        passphrase: &str,
        frame: Frame,
        kind: &'static str,
    ) -> Result<(), SignalError> {
        match target.send(frame) {
            Ok(()) => {
                counter!("flare_messages_relayed_total", 1, "kind" => kind);
                Ok(())
            }
            Err(err) => {
                self.registry.destroy_session(passphrase);
                Err(err)
            }
        }
    }
}

/// Queues the relayed offer followed by every buffered candidate. A failed
/// write is logged and skipped; the requester's own disconnect cleans up.
fn deliver_attachment(conn: &ConnectionHandle, attachment: &Attachment) {
    let offer = SignalingMessage::Offer {
        sdp: attachment.offer_sdp.clone(),
    };
    if let Err(err) = conn.send_message(&offer) {
        warn!(connection_id = %conn.id(), error = %err, "failed to queue relayed offer");
    }
    for candidate in &attachment.pending_candidates {
        let message = SignalingMessage::IceCandidate {
            passphrase: attachment.passphrase.clone(),
            candidate: candidate.clone(),
        };
        if let Err(err) = conn.send_message(&message) {
            warn!(connection_id = %conn.id(), error = %err, "failed to queue buffered candidate");
            continue;
        }
        counter!("flare_messages_relayed_total", 1, "kind" => "ice-candidate");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use crate::connection::{ConnectionId, Outbound};
    use crate::passphrase::PassphraseGenerator;
    use crate::protocol::CloseReason;
    use crate::registry::SessionState;

    struct Fixed(&'static str);

    impl PassphraseGenerator for Fixed {
        fn generate(&self) -> Result<String, SignalError> {
            Ok(self.0.to_string())
        }
    }

    struct Peer {
        handle: ConnectionHandle,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Peer {
        fn new() -> Self {
            let (handle, rx) = ConnectionHandle::new(ConnectionId::next());
            Self { handle, rx }
        }

        fn send(&self, router: &SignalingRouter, value: Value) -> Result<(), SignalError> {
            router.handle_frame(&self.handle, Frame::Text(value.to_string()))
        }

        fn next_json(&mut self) -> Value {
            match self.rx.try_recv().expect("queued outbound") {
                Outbound::Frame(frame) => serde_json::from_slice(frame.as_bytes()).unwrap(),
                Outbound::Close(reason) => panic!("unexpected close: {reason}"),
            }
        }

        fn next_raw(&mut self) -> Frame {
            match self.rx.try_recv().expect("queued outbound") {
                Outbound::Frame(frame) => frame,
                Outbound::Close(reason) => panic!("unexpected close: {reason}"),
            }
        }

        fn next_close(&mut self) -> CloseReason {
            match self.rx.try_recv().expect("queued outbound") {
                Outbound::Close(reason) => reason,
                Outbound::Frame(frame) => panic!("unexpected frame: {frame:?}"),
            }
        }

        fn is_idle(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    fn router() -> SignalingRouter {
        SignalingRouter::new(SessionRegistry::new(Arc::new(Fixed("alpha-bravo-charlie"))))
    }

    #[test_timeout::timeout]
    fn offer_replies_with_passphrase() {
        let router = router();
        let mut offerer = Peer::new();
        offerer
            .send(&router, json!({"type": "offer", "sdp": "sdp-A"}))
            .unwrap();
        assert_eq!(
            offerer.next_json(),
            json!({"type": "passphrase", "passphrase": "alpha-bravo-charlie"})
        );
        assert_eq!(
            router.registry().session_state("alpha-bravo-charlie"),
            Some(SessionState::Offered)
        );
    }

    #[test_timeout::timeout]
    fn connection_request_relays_offer_then_buffered_candidates() {
        let router = router();
        let mut offerer = Peer::new();
        let mut requester = Peer::new();
        offerer
            .send(&router, json!({"type": "offer", "sdp": "sdp-A"}))
            .unwrap();
        offerer.next_json();
        for candidate in ["cand-1", "cand-2"] {
            offerer
                .send(
                    &router,
                    json!({"type": "ice-candidate", "passphrase": "alpha-bravo-charlie", "candidate": candidate}),
                )
                .unwrap();
        }
        assert!(offerer.is_idle());

        requester
            .send(
                &router,
                json!({"type": "connection-request", "passphrase": "alpha-bravo-charlie"}),
            )
            .unwrap();
        assert_eq!(requester.next_json(), json!({"type": "offer", "sdp": "sdp-A"}));
        for candidate in ["cand-1", "cand-2"] {
            assert_eq!(
                requester.next_json(),
                json!({"type": "ice-candidate", "passphrase": "alpha-bravo-charlie", "candidate": candidate})
            );
        }
        assert!(requester.is_idle());
        assert_eq!(
            router.registry().session_state("alpha-bravo-charlie"),
            Some(SessionState::Paired)
        );
    }

    fn candidate(value: &str) -> Value {
        json!({"type": "ice-candidate", "passphrase": "alpha-bravo-charlie", "candidate": value})
    }

    #[test_timeout::timeout]
    fn flushed_candidates_precede_candidates_sent_after_attachment() {
        let router = router();
        let mut offerer = Peer::new();
        let mut requester = Peer::new();
        offerer
            .send(&router, json!({"type": "offer", "sdp": "sdp-A"}))
            .unwrap();
        offerer.next_json();
        offerer.send(&router, candidate("cand-1")).unwrap();
        offerer.send(&router, candidate("cand-2")).unwrap();

        requester
            .send(
                &router,
                json!({"type": "connection-request", "passphrase": "alpha-bravo-charlie"}),
            )
            .unwrap();
        offerer.send(&router, candidate("cand-3")).unwrap();

        assert_eq!(requester.next_json(), json!({"type": "offer", "sdp": "sdp-A"}));
        assert_eq!(requester.next_json(), candidate("cand-1"));
        assert_eq!(requester.next_json(), candidate("cand-2"));
        assert_eq!(requester.next_json(), candidate("cand-3"));
        assert!(requester.is_idle());
        assert!(offerer.is_idle());
    }

    #[test_timeout::timeout]
    fn candidates_racing_an_attachment_keep_offerer_order() {
        for _ in 0..100 {
            let router = router();
            let mut offerer = Peer::new();
            let mut requester = Peer::new();
            offerer
                .send(&router, json!({"type": "offer", "sdp": "sdp-A"}))
                .unwrap();
            offerer.next_json();
            offerer.send(&router, candidate("b0")).unwrap();

            let start = Barrier::new(2);
            let (offerer_handle, requester_handle) = (&offerer.handle, &requester.handle);
            let (router, start) = (&router, &start);
            thread::scope(|scope| {
                scope.spawn(move || {
                    start.wait();
                    for n in 1..20 {
                        let frame = Frame::Text(candidate(&format!("c{n}")).to_string());
                        router.handle_frame(offerer_handle, frame).unwrap();
                    }
                });
                scope.spawn(move || {
                    start.wait();
                    let request =
                        json!({"type": "connection-request", "passphrase": "alpha-bravo-charlie"});
                    router
                        .handle_frame(requester_handle, Frame::Text(request.to_string()))
                        .unwrap();
                });
            });

            assert_eq!(requester.next_json(), json!({"type": "offer", "sdp": "sdp-A"}));
            assert_eq!(requester.next_json(), candidate("b0"));
            for n in 1..20 {
                assert_eq!(requester.next_json(), candidate(&format!("c{n}")));
            }
            assert!(requester.is_idle());
            assert_eq!(
                router.registry().pending_candidates("alpha-bravo-charlie"),
                Some(Vec::new())
            );
        }
    }

    #[test_timeout::timeout]
    fn answer_is_forwarded_verbatim_to_offerer() {
        let router = router();
        let mut offerer = Peer::new();
        let mut requester = Peer::new();
        offerer
            .send(&router, json!({"type": "offer", "sdp": "sdp-A"}))
            .unwrap();
        offerer.next_json();
        requester
            .send(
                &router,
                json!({"type": "connection-request", "passphrase": "alpha-bravo-charlie"}),
            )
            .unwrap();
        requester.next_json();

        // Odd spacing and an extra field must survive the relay untouched.
        let raw = r#"{ "type":"answer","passphrase":"alpha-bravo-charlie","sdp":"sdp-B","x":1 }"#;
        router
            .handle_frame(&requester.handle, Frame::Text(raw.to_string()))
            .unwrap();
        assert_eq!(offerer.next_raw(), Frame::Text(raw.to_string()));
        assert!(requester.is_idle());
    }

    #[test_timeout::timeout]
    fn paired_candidates_are_forwarded_once_to_the_other_side() {
        let router = router();
        let mut offerer = Peer::new();
        let mut requester = Peer::new();
        offerer
            .send(&router, json!({"type": "offer", "sdp": "sdp-A"}))
            .unwrap();
        offerer.next_json();
        requester
            .send(
                &router,
                json!({"type": "connection-request", "passphrase": "alpha-bravo-charlie"}),
            )
            .unwrap();
        requester.next_json();

        let from_requester = json!({"type": "ice-candidate", "passphrase": "alpha-bravo-charlie", "candidate": "r-1"});
        requester.send(&router, from_requester.clone()).unwrap();
        assert_eq!(offerer.next_json(), from_requester);
        assert!(offerer.is_idle());
        assert!(requester.is_idle());

        let binary = br#"{"type":"ice-candidate","passphrase":"alpha-bravo-charlie","candidate":"o-1"}"#.to_vec();
        router
            .handle_frame(&offerer.handle, Frame::Binary(binary.clone()))
            .unwrap();
        assert_eq!(requester.next_raw(), Frame::Binary(binary));
        assert!(offerer.is_idle());
    }

    #[test_timeout::timeout]
    fn unknown_passphrase_closes_with_protocol_error() {
        let router = router();
        let mut requester = Peer::new();
        let err = requester
            .send(&router, json!({"type": "connection-request", "passphrase": "zzz"}))
            .unwrap_err();
        assert!(matches!(err, SignalError::SessionNotFound(_)));
        let reason = requester.next_close();
        assert_eq!(reason.code, 1002);
        assert!(reason.detail.contains("session not found"));
    }

    #[test_timeout::timeout]
    fn stranger_candidate_closes_sender_and_forwards_nothing() {
        let router = router();
        let mut offerer = Peer::new();
        let mut stranger = Peer::new();
        offerer
            .send(&router, json!({"type": "offer", "sdp": "sdp-A"}))
            .unwrap();
        offerer.next_json();

        let err = stranger
            .send(
                &router,
                json!({"type": "ice-candidate", "passphrase": "alpha-bravo-charlie", "candidate": "x"}),
            )
            .unwrap_err();
        assert!(matches!(err, SignalError::StrangerConnection(_)));
        assert_eq!(stranger.next_close().code, 1002);
        assert!(offerer.is_idle());
        assert_eq!(
            router.registry().pending_candidates("alpha-bravo-charlie"),
            Some(Vec::new())
        );
    }

    #[test_timeout::timeout]
    fn malformed_and_unknown_messages_close_as_not_acceptable() {
        let router = router();
        let mut peer = Peer::new();
        let err = router
            .handle_frame(&peer.handle, Frame::Text("{oops".into()))
            .unwrap_err();
        assert!(matches!(err, SignalError::Decode(_)));
        assert_eq!(peer.next_close(), CloseReason::not_acceptable("invalid JSON"));

        let mut peer = Peer::new();
        peer.send(&router, json!({"type": "greeting"})).unwrap_err();
        assert_eq!(peer.next_close(), CloseReason::not_acceptable("invalid message"));
    }

    #[test_timeout::timeout]
    fn forwarding_to_a_vanished_offerer_destroys_the_session() {
        let router = router();
        let offerer = Peer::new();
        let mut requester = Peer::new();
        offerer
            .send(&router, json!({"type": "offer", "sdp": "sdp-A"}))
            .unwrap();
        requester
            .send(
                &router,
                json!({"type": "connection-request", "passphrase": "alpha-bravo-charlie"}),
            )
            .unwrap();
        requester.next_json();
        drop(offerer.rx);

        let err = requester
            .send(
                &router,
                json!({"type": "answer", "passphrase": "alpha-bravo-charlie", "sdp": "sdp-B"}),
            )
            .unwrap_err();
        assert!(matches!(err, SignalError::Forwarding(_)));
        assert_eq!(requester.next_close().code, 1002);
        assert_eq!(router.registry().session_state("alpha-bravo-charlie"), None);
        assert_eq!(router.registry().passphrase_of(requester.handle.id()), None);
    }
}
