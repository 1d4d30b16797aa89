//! Passphrase → session table and the connection back-index, guarded by one
//! lock so every cross-structure update is atomic.
//!
//! A session moves `Offered` → `Paired` → closed. Closed sessions are simply
//! absent from the table; nothing ever brings them back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::SignalError;
use crate::index::ConnectionIndex;
use crate::passphrase::PassphraseGenerator;
use crate::protocol::CloseReason;

/// Fresh passphrases drawn before giving up on a collision-free one.
const MAX_PASSPHRASE_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offered,
    Paired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Requester,
}

/// What a requester receives on attaching: the stored offer and every
/// candidate the offerer sent before the requester showed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub passphrase: String,
    pub offer_sdp: String,
    pub pending_candidates: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum CandidateRoute {
    /// Held until a requester attaches.
    Buffered,
    Forward(ConnectionHandle),
}

/// Result of tearing down the session a disconnected connection belonged to.
#[derive(Debug, Clone)]
pub struct Teardown {
    pub passphrase: String,
    pub role: Role,
    pub peer: Option<ConnectionHandle>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub offered: usize,
    pub paired: usize,
    pub indexed_connections: usize,
    pub buffered_candidates: usize,
}

struct Session {
    offerer: ConnectionHandle,
    requester: Option<ConnectionHandle>,
    offer_sdp: String,
    pending_candidates: Vec<String>,
    created_at: Instant,
}

impl Session {
    fn state(&self) -> SessionState {
        if self.requester.is_some() {
            SessionState::Paired
        } else {
            SessionState::Offered
        }
    }

    fn role_of(&self, connection: ConnectionId) -> Option<Role> {
        if self.offerer.id() == connection {
            Some(Role::Offerer)
        } else if self.requester.as_ref().map(ConnectionHandle::id) == Some(connection) {
            Some(Role::Requester)
        } else {
            None
        }
    }

    fn peer_of(&self, role: Role) -> Option<ConnectionHandle> {
        match role {
            Role::Offerer => self.requester.clone(),
            Role::Requester => Some(self.offerer.clone()),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Session>,
    index: ConnectionIndex,
}

impl RegistryInner {
    /// Removes the session and the index entries of both participants.
    fn remove(&mut self, passphrase: &str) -> Option<Session> {
        let session = self.sessions.remove(passphrase)?;
        self.index.unregister_if(session.offerer.id(), passphrase);
        if let Some(requester) = &session.requester {
            self.index.unregister_if(requester.id(), passphrase);
        }
        gauge!("flare_sessions_active", self.sessions.len() as f64);
        Some(session)
    }

    fn find_by_scan(&self, connection: ConnectionId) -> Option<String> {
        self.sessions
            .iter()
            .find(|(_, session)| session.role_of(connection).is_some())
            .map(|(passphrase, _)| passphrase.clone())
    }

    fn ensure_unattached(&self, connection: ConnectionId) -> Result<(), SignalError> {
        match self.index.lookup(connection) {
            Some(_) => Err(SignalError::ConnectionBusy(connection)),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    generator: Arc<dyn PassphraseGenerator>,
}

impl SessionRegistry {
    pub fn new(generator: Arc<dyn PassphraseGenerator>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            generator,
        }
    }

    /// Stores a new `Offered` session owned by `offerer` and returns its
    /// passphrase. A passphrase already in use is never overwritten; a new
    /// one is drawn instead.
    pub fn create_session(
        &self,
        offerer: &ConnectionHandle,
        offer_sdp: impl Into<String>,
    ) -> Result<String, SignalError> {
        let mut inner = self.inner.lock();
        inner.ensure_unattached(offerer.id())?;

        let mut passphrase = None;
        for attempt in 1..=MAX_PASSPHRASE_ATTEMPTS {
            let candidate = self.generator.generate()?;
            if !inner.sessions.contains_key(&candidate) {
                passphrase = Some(candidate);
                break;
            }
            warn!(attempt, "generated passphrase collides with a live session");
            counter!("flare_passphrase_collisions_total", 1);
        }
        let passphrase = passphrase.ok_or_else(|| {
            SignalError::EntropySource("passphrase space exhausted".to_string())
        })?;

        inner.sessions.insert(
            passphrase.clone(),
            Session {
                offerer: offerer.clone(),
                requester: None,
                offer_sdp: offer_sdp.into(),
                pending_candidates: Vec::new(),
                created_at: Instant::now(),
            },
        );
        inner.index.register(offerer.id(), passphrase.clone());
        gauge!("flare_sessions_active", inner.sessions.len() as f64);
        counter!("flare_sessions_created_total", 1);
        debug!(connection_id = %offerer.id(), "session offered");

        Ok(passphrase)
    }

    pub fn attach_requester(
        &self,
        passphrase: &str,
        requester: &ConnectionHandle,
    ) -> Result<Attachment, SignalError> {
        self.attach_requester_with(passphrase, requester, |_| {})
    }

    /// Attaches `requester` and drains the buffered candidates. `deliver` runs
    /// before the lock is released, so whatever it queues for the requester
    /// lands ahead of any candidate forwarded after the attachment. It must
    /// only enqueue, never wait on I/O.
    pub fn attach_requester_with<F>(
        &self,
        passphrase: &str,
        requester: &ConnectionHandle,
        deliver: F,
    ) -> Result<Attachment, SignalError>
    where
        F: FnOnce(&Attachment),
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let session = inner
            .sessions
            .get_mut(passphrase)
            .ok_or_else(|| SignalError::SessionNotFound(passphrase.to_string()))?;
        if session.requester.is_some() {
            return Err(SignalError::AlreadyPaired(passphrase.to_string()));
        }
        if inner.index.lookup(requester.id()).is_some() {
            return Err(SignalError::ConnectionBusy(requester.id()));
        }

        session.requester = Some(requester.clone());
        let attachment = Attachment {
            passphrase: passphrase.to_string(),
            offer_sdp: session.offer_sdp.clone(),
            pending_candidates: std::mem::take(&mut session.pending_candidates),
        };
        inner.index.register(requester.id(), passphrase);
        counter!("flare_sessions_paired_total", 1);
        debug!(
            connection_id = %requester.id(),
            flushed = attachment.pending_candidates.len(),
            "requester attached"
        );

        deliver(&attachment);
        Ok(attachment)
    }

    /// Returns the offerer the answer has to be relayed to.
    pub fn forward_answer(&self, passphrase: &str) -> Result<ConnectionHandle, SignalError> {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(passphrase)
            .map(|session| session.offerer.clone())
            .ok_or_else(|| SignalError::SessionNotFound(passphrase.to_string()))
    }

    /// Buffers an offerer candidate while no requester is attached; otherwise
    /// names the opposite participant as the forwarding target.
    pub fn add_or_forward_candidate(
        &self,
        passphrase: &str,
        from: ConnectionId,
        candidate: &str,
    ) -> Result<CandidateRoute, SignalError> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(passphrase)
            .ok_or_else(|| SignalError::SessionNotFound(passphrase.to_string()))?;
        let role = session
            .role_of(from)
            .ok_or(SignalError::StrangerConnection(from))?;

        match session.peer_of(role) {
            Some(target) => Ok(CandidateRoute::Forward(target)),
            None => {
                session.pending_candidates.push(candidate.to_string());
                counter!("flare_candidates_buffered_total", 1);
                Ok(CandidateRoute::Buffered)
            }
        }
    }

    /// Removes the session and its index entries. Returns whether anything
    /// was removed; unknown passphrases are a no-op.
    pub fn destroy_session(&self, passphrase: &str) -> bool {
        let removed = self.inner.lock().remove(passphrase).is_some();
        if removed {
            counter!("flare_sessions_closed_total", 1, "reason" => "destroyed");
        }
        removed
    }

    /// Removes whichever session `connection` participates in and reports the
    /// other participant. The index answers in O(1); the table scan only
    /// covers an index entry that went missing.
    pub fn destroy_by_connection(&self, connection: ConnectionId) -> Option<Teardown> {
        let mut inner = self.inner.lock();
        let passphrase = match inner.index.lookup(connection) {
            Some(passphrase) => passphrase.to_string(),
            None => {
                let passphrase = inner.find_by_scan(connection)?;
                warn!(
                    connection_id = %connection,
                    "connection missing from index, found its session by scan"
                );
                passphrase
            }
        };

        let Some(role) = inner
            .sessions
            .get(&passphrase)
            .and_then(|session| session.role_of(connection))
        else {
            inner.index.unregister(connection);
            return None;
        };

        let session = inner.remove(&passphrase)?;
        counter!("flare_sessions_closed_total", 1, "reason" => "disconnect");
        Some(Teardown {
            peer: session.peer_of(role),
            passphrase,
            role,
        })
    }

    /// Drops `Offered` sessions created at least `ttl` before `now` and
    /// returns their offerers.
    pub fn expire_offers(&self, ttl: Duration, now: Instant) -> Vec<ConnectionHandle> {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, session)| {
                session.state() == SessionState::Offered
                    && now.saturating_duration_since(session.created_at) >= ttl
            })
            .map(|(passphrase, _)| passphrase.clone())
            .collect();

        let mut offerers = Vec::with_capacity(expired.len());
        for passphrase in expired {
            if let Some(session) = inner.remove(&passphrase) {
                counter!("flare_sessions_closed_total", 1, "reason" => "expired");
                offerers.push(session.offerer);
            }
        }
        offerers
    }

    /// Periodically expires unanswered offers and closes their offerers.
    pub fn spawn_reaper(&self, ttl: Duration, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let mut ticker = tokio::time::interval(interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let expired = registry.expire_offers(ttl, Instant::now());
                if expired.is_empty() {
                    continue;
                }
                info!(count = expired.len(), "expired unanswered offers");
                for offerer in expired {
                    let reason = CloseReason::offer_expired();
                    counter!("flare_connections_closed_total", 1, "reason" => reason.label());
                    offerer.close(reason);
                }
            }
        })
    }

    pub fn session_state(&self, passphrase: &str) -> Option<SessionState> {
        self.inner
            .lock()
            .sessions
            .get(passphrase)
            .map(Session::state)
    }

    pub fn passphrase_of(&self, connection: ConnectionId) -> Option<String> {
        self.inner.lock().index.lookup(connection).map(str::to_string)
    }

    pub fn pending_candidates(&self, passphrase: &str) -> Option<Vec<String>> {
        self.inner
            .lock()
            .sessions
            .get(passphrase)
            .map(|session| session.pending_candidates.clone())
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        let mut stats = RegistryStats {
            active_sessions: inner.sessions.len(),
            indexed_connections: inner.index.len(),
            ..RegistryStats::default()
        };
        for session in inner.sessions.values() {
            match session.state() {
                SessionState::Offered => stats.offered += 1,
                SessionState::Paired => stats.paired += 1,
            }
            stats.buffered_candidates += session.pending_candidates.len();
        }
        stats
    }

    #[cfg(test)]
    fn forget_index_entry(&self, connection: ConnectionId) {
        self.inner.lock().index.unregister(connection);
    }
}
