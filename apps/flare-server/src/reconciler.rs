use metrics::counter;
use tracing::{debug, info};

use crate::connection::ConnectionId;
use crate::protocol::CloseReason;
use crate::registry::{Role, SessionRegistry, Teardown};

/// Cleans up after a closed connection: drops its session and tells the
/// other participant, if any, that its peer went away.
#[derive(Clone)]
pub struct DisconnectReconciler {
    registry: SessionRegistry,
}

impl DisconnectReconciler {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Safe to call any number of times for the same connection; only the
    /// first call that still finds a session does anything.
    pub fn on_disconnect(&self, connection: ConnectionId) -> Option<Teardown> {
        let Some(teardown) = self.registry.destroy_by_connection(connection) else {
            debug!(connection_id = %connection, "disconnect with no live session");
            return None;
        };

        if let Some(peer) = &teardown.peer {
            let reason = match teardown.role {
                Role::Offerer => CloseReason::sender_disconnected(),
                Role::Requester => CloseReason::receiver_disconnected(),
            };
            counter!("flare_connections_closed_total", 1, "reason" => reason.label());
            peer.close(reason);
        }

        info!(
            connection_id = %connection,
            role = ?teardown.role,
            peer_notified = teardown.peer.is_some(),
            "session closed after disconnect"
        );
        Some(teardown)
    }
}
