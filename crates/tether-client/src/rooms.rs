//! Rooms the caller asked to be in.

use std::collections::BTreeSet;

use tether_protocol::RoomName;

/// The set of rooms to (re)join on every authenticated connection.
///
/// This is the caller's intent, not the server's view: a room stays here
/// across disconnects until the caller leaves it.
#[derive(Debug, Default, Clone)]
pub struct RoomTracker {
    rooms: BTreeSet<RoomName>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `room`. Returns `false` if it was already tracked.
    pub fn join(&mut self, room: RoomName) -> bool {
        self.rooms.insert(room)
    }

    /// Forgets `room`. Returns `false` if it wasn't tracked.
    pub fn leave(&mut self, room: &RoomName) -> bool {
        self.rooms.remove(room)
    }

    /// Rooms to send `join` for after (re)authentication, in name order.
    pub fn replay(&self) -> Vec<RoomName> {
        self.rooms.iter().cloned().collect()
    }

    pub fn contains(&self, room: &RoomName) -> bool {
        self.rooms.contains(room)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_is_idempotent() {
        let mut t = RoomTracker::new();
        assert!(t.join("route:R1".into()));
        assert!(!t.join("route:R1".into()));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_leave_removes_only_that_room() {
        let mut t = RoomTracker::new();
        t.join("route:R1".into());
        t.join("route:R2".into());

        assert!(t.leave(&"route:R1".into()));
        assert!(!t.leave(&"route:R1".into()));
        assert_eq!(t.replay(), vec![RoomName::new("route:R2")]);
    }

    #[test]
    fn test_replay_is_sorted() {
        let mut t = RoomTracker::new();
        t.join("b".into());
        t.join("a".into());
        assert_eq!(t.replay(), vec![RoomName::new("a"), RoomName::new("b")]);
    }
}
