//! The connection registry: who is connected, and in what auth state.
//!
//! # Concurrency note
//!
//! `ConnectionRegistry` is a plain pair of `HashMap`s. The server wraps it
//! in one mutex next to the room registry, so a connection's record and
//! its room memberships always change together.

use std::collections::{HashMap, HashSet};
use std::time::{Instant, SystemTime};

use tether_protocol::Identity;
use tether_transport::ConnectionId;

use crate::GateError;

/// Auth status of a live connection, as seen by the rest of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Authorized,
    /// Running on an expired credential until the grace window closes.
    Grace,
}

/// One live connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub identity: Identity,
    pub status: ConnectionStatus,
    /// When a valid credential was last presented on this connection.
    /// `None` if it has only ever shown an expired one.
    pub last_valid_at: Option<SystemTime>,
    pub connected_at: Instant,
}

/// Tracks every authenticated connection, indexed by connection id and by
/// subject.
///
/// One subject can hold many connections at once (a phone and a laptop,
/// or two tabs), so unlike a session table keyed by user this never
/// evicts an existing connection when the same subject connects again.
///
/// ```text
/// register() ──→ [Authorized] ⇄ [Grace] ──→ remove()
///                      │
///                 update() on re-auth (subject may change)
/// ```
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    /// Subject id → connections. Kept in sync with `connections`; a
    /// subject with no connections has no entry.
    by_subject: HashMap<String, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly admitted connection.
    ///
    /// # Errors
    /// [`GateError::AlreadyRegistered`] if the id is already present.
    pub fn register(
        &mut self,
        connection_id: ConnectionId,
        identity: Identity,
        status: ConnectionStatus,
        last_valid_at: Option<SystemTime>,
    ) -> Result<&ConnectionRecord, GateError> {
        if self.connections.contains_key(&connection_id) {
            return Err(GateError::AlreadyRegistered(connection_id));
        }
        self.by_subject
            .entry(identity.id.clone())
            .or_default()
            .insert(connection_id);

        tracing::info!(%connection_id, subject = %identity.id, ?status, "connection registered");

        let record = ConnectionRecord {
            connection_id,
            identity,
            status,
            last_valid_at,
            connected_at: Instant::now(),
        };
        Ok(self.connections.entry(connection_id).or_insert(record))
    }

    /// Replaces the identity after a successful re-auth, re-indexing if
    /// the subject changed.
    ///
    /// # Errors
    /// [`GateError::NotRegistered`] for an unknown id.
    pub fn update_identity(
        &mut self,
        connection_id: ConnectionId,
        identity: Identity,
        last_valid_at: Option<SystemTime>,
    ) -> Result<(), GateError> {
        let record = self
            .connections
            .get_mut(&connection_id)
            .ok_or(GateError::NotRegistered(connection_id))?;

        if record.identity.id != identity.id {
            unindex(&mut self.by_subject, &record.identity.id, connection_id);
            self.by_subject
                .entry(identity.id.clone())
                .or_default()
                .insert(connection_id);
        }
        record.identity = identity;
        record.status = ConnectionStatus::Authorized;
        if last_valid_at.is_some() {
            record.last_valid_at = last_valid_at;
        }
        Ok(())
    }

    /// Sets the auth status of a connection.
    ///
    /// # Errors
    /// [`GateError::NotRegistered`] for an unknown id.
    pub fn set_status(
        &mut self,
        connection_id: ConnectionId,
        status: ConnectionStatus,
    ) -> Result<(), GateError> {
        let record = self
            .connections
            .get_mut(&connection_id)
            .ok_or(GateError::NotRegistered(connection_id))?;
        record.status = status;
        Ok(())
    }

    /// Forgets a connection. Returns its record if it was registered.
    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<ConnectionRecord> {
        let record = self.connections.remove(&connection_id)?;
        unindex(&mut self.by_subject, &record.identity.id, connection_id);
        tracing::info!(%connection_id, subject = %record.identity.id, "connection removed");
        Some(record)
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<&ConnectionRecord> {
        self.connections.get(&connection_id)
    }

    /// All connections held by `subject`, in id order.
    pub fn connections_of(&self, subject: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .by_subject
            .get(subject)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Connections currently running on a grace window.
    pub fn in_grace(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .connections
            .values()
            .filter(|r| r.status == ConnectionStatus::Grace)
            .map(|r| r.connection_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of distinct subjects connected.
    pub fn subject_count(&self) -> usize {
        self.by_subject.len()
    }
}

fn unindex(
    by_subject: &mut HashMap<String, HashSet<ConnectionId>>,
    subject: &str,
    connection_id: ConnectionId,
) {
    if let Some(set) = by_subject.get_mut(subject) {
        set.remove(&connection_id);
        if set.is_empty() {
            by_subject.remove(subject);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(id: &str) -> Identity {
        Identity {
            id: id.into(),
            role: "driver".into(),
            username: id.into(),
        }
    }

    fn conn(n: u64) -> ConnectionId {
        ConnectionId::new(n)
    }

    fn registry_with(entries: &[(u64, &str)]) -> ConnectionRegistry {
        let mut reg = ConnectionRegistry::new();
        for (n, sub) in entries {
            reg.register(conn(*n), ident(sub), ConnectionStatus::Authorized, None)
                .unwrap();
        }
        reg
    }

    #[test]
    fn test_register_new_connection_is_tracked() {
        let mut reg = ConnectionRegistry::new();
        let rec = reg
            .register(conn(1), ident("u1"), ConnectionStatus::Grace, None)
            .unwrap();

        assert_eq!(rec.identity.id, "u1");
        assert_eq!(rec.status, ConnectionStatus::Grace);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_duplicate_id_returns_error() {
        let mut reg = registry_with(&[(1, "u1")]);
        let result = reg.register(conn(1), ident("u2"), ConnectionStatus::Authorized, None);
        assert!(matches!(result, Err(GateError::AlreadyRegistered(_))));
    }

    #[test]
    fn test_register_same_subject_twice_keeps_both() {
        let reg = registry_with(&[(1, "u1"), (2, "u1")]);
        assert_eq!(reg.connections_of("u1"), vec![conn(1), conn(2)]);
        assert_eq!(reg.subject_count(), 1);
    }

    #[test]
    fn test_remove_last_connection_drops_subject() {
        let mut reg = registry_with(&[(1, "u1"), (2, "u1")]);

        reg.remove(conn(1));
        assert_eq!(reg.connections_of("u1"), vec![conn(2)]);

        reg.remove(conn(2));
        assert!(reg.connections_of("u1").is_empty());
        assert_eq!(reg.subject_count(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_remove_unknown_returns_none() {
        let mut reg = ConnectionRegistry::new();
        assert!(reg.remove(conn(9)).is_none());
    }

    #[test]
    fn test_update_identity_reindexes_subject() {
        let mut reg = registry_with(&[(1, "u1")]);
        reg.set_status(conn(1), ConnectionStatus::Grace).unwrap();

        reg.update_identity(conn(1), ident("u2"), Some(SystemTime::now()))
            .unwrap();

        assert!(reg.connections_of("u1").is_empty());
        assert_eq!(reg.connections_of("u2"), vec![conn(1)]);
        let rec = reg.get(conn(1)).unwrap();
        assert_eq!(rec.status, ConnectionStatus::Authorized);
        assert!(rec.last_valid_at.is_some());
    }

    #[test]
    fn test_update_identity_unknown_returns_not_registered() {
        let mut reg = ConnectionRegistry::new();
        let result = reg.update_identity(conn(1), ident("u1"), None);
        assert!(matches!(result, Err(GateError::NotRegistered(_))));
    }

    #[test]
    fn test_in_grace_lists_only_grace_connections() {
        let mut reg = registry_with(&[(1, "u1"), (2, "u2"), (3, "u3")]);
        reg.set_status(conn(3), ConnectionStatus::Grace).unwrap();
        reg.set_status(conn(1), ConnectionStatus::Grace).unwrap();

        assert_eq!(reg.in_grace(), vec![conn(1), conn(3)]);
    }
}
