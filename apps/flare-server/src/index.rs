use std::collections::HashMap;

use crate::connection::ConnectionId;

/// Back-references from a live connection to the passphrase of the session
/// it participates in. Lives inside the registry lock so it never drifts
/// from the session table.
#[derive(Debug, Default)]
pub struct ConnectionIndex {
    entries: HashMap<ConnectionId, String>,
}

impl ConnectionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connection: ConnectionId, passphrase: impl Into<String>) {
        self.entries.insert(connection, passphrase.into());
    }

    pub fn lookup(&self, connection: ConnectionId) -> Option<&str> {
        self.entries.get(&connection).map(String::as_str)
    }

    pub fn unregister(&mut self, connection: ConnectionId) -> Option<String> {
        self.entries.remove(&connection)
    }

    /// Removes the entry only while it still points at `passphrase`.
    pub fn unregister_if(&mut self, connection: ConnectionId, passphrase: &str) -> bool {
        if self.lookup(connection) == Some(passphrase) {
            self.entries.remove(&connection);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn register_overwrites_and_unregister_removes() {
        let mut index = ConnectionIndex::new();
        let conn = ConnectionId::from_raw(1);
        index.register(conn, "alpha");
        index.register(conn, "bravo");
        assert_eq!(index.lookup(conn), Some("bravo"));
        assert_eq!(index.len(), 1);

        assert_eq!(index.unregister(conn).as_deref(), Some("bravo"));
        assert_eq!(index.lookup(conn), None);
        assert_eq!(index.unregister(conn), None);
        assert!(index.is_empty());
    }

    #[test_timeout::timeout]
    fn unregister_if_leaves_other_sessions_alone() {
        let mut index = ConnectionIndex::new();
        let conn = ConnectionId::from_raw(2);
        index.register(conn, "alpha");
        assert!(!index.unregister_if(conn, "bravo"));
        assert_eq!(index.lookup(conn), Some("alpha"));
        assert!(index.unregister_if(conn, "alpha"));
        assert!(index.is_empty());
    }
}
