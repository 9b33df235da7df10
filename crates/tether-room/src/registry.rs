//! Room registry: tracks which connection is in which rooms.

use std::collections::{BTreeSet, HashMap, HashSet};

use tether_protocol::RoomName;
use tether_transport::ConnectionId;
use tokio::sync::mpsc;

use crate::{RoomConfig, RoomError};

/// The channel a connection task drains to write events to its socket.
///
/// Unbounded so a slow socket never blocks a broadcast to everyone else.
pub type Outbox<T> = mpsc::UnboundedSender<T>;

/// Membership table for every room on the server.
///
/// Two indexes are kept in sync:
///
/// ```text
/// rooms:        "route:R1" → { conn-1, conn-4 }
/// memberships:  conn-1     → { "route:R1", "depot:7" }
/// ```
///
/// A room with no members has no entry, so `room_count()` is the number
/// of rooms anyone is actually listening to.
pub struct RoomRegistry<T> {
    config: RoomConfig,
    outboxes: HashMap<ConnectionId, Outbox<T>>,
    memberships: HashMap<ConnectionId, BTreeSet<RoomName>>,
    rooms: HashMap<RoomName, HashSet<ConnectionId>>,
}

impl<T: Clone> RoomRegistry<T> {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            config,
            outboxes: HashMap::new(),
            memberships: HashMap::new(),
            rooms: HashMap::new(),
        }
    }

    /// Registers a connection's outbox. Must precede any `join`.
    ///
    /// # Errors
    /// [`RoomError::AlreadyAttached`] if the id is already attached.
    pub fn attach(&mut self, conn: ConnectionId, outbox: Outbox<T>) -> Result<(), RoomError> {
        if self.outboxes.contains_key(&conn) {
            return Err(RoomError::AlreadyAttached(conn));
        }
        self.outboxes.insert(conn, outbox);
        self.memberships.insert(conn, BTreeSet::new());
        Ok(())
    }

    /// Removes a connection from every room it joined and drops its
    /// outbox. Returns the rooms it was in. A no-op for unknown ids.
    pub fn detach(&mut self, conn: ConnectionId) -> Vec<RoomName> {
        self.outboxes.remove(&conn);
        let Some(joined) = self.memberships.remove(&conn) else {
            return Vec::new();
        };
        for room in &joined {
            self.drop_member(room, conn);
        }
        joined.into_iter().collect()
    }

    /// Adds `conn` to `room`, creating the room if needed.
    ///
    /// Returns `false` if it was already a member. Joining twice is not an
    /// error.
    ///
    /// # Errors
    /// - [`RoomError::NotAttached`] for an unknown connection
    /// - [`RoomError::InvalidName`] for an empty room name
    /// - [`RoomError::TooManyRooms`] at the per-connection limit
    pub fn join(&mut self, conn: ConnectionId, room: RoomName) -> Result<bool, RoomError> {
        if room.as_str().is_empty() {
            return Err(RoomError::InvalidName(room));
        }
        let joined = self
            .memberships
            .get_mut(&conn)
            .ok_or(RoomError::NotAttached(conn))?;
        if joined.contains(&room) {
            return Ok(false);
        }
        let limit = self.config.max_rooms_per_connection;
        if joined.len() >= limit {
            return Err(RoomError::TooManyRooms(conn, limit));
        }
        joined.insert(room.clone());
        let members = self.rooms.entry(room.clone()).or_default();
        members.insert(conn);
        tracing::debug!(%conn, %room, members = members.len(), "joined room");
        Ok(true)
    }

    /// Removes `conn` from `room`. Returns `false` if it wasn't a member.
    pub fn leave(&mut self, conn: ConnectionId, room: &RoomName) -> bool {
        let removed = self
            .memberships
            .get_mut(&conn)
            .is_some_and(|joined| joined.remove(room));
        if removed {
            self.drop_member(room, conn);
            tracing::debug!(%conn, %room, "left room");
        }
        removed
    }

    /// Pushes `msg` into the outbox of every member of `room`.
    ///
    /// Returns how many outboxes accepted it. Members whose task has
    /// already exited are skipped; they are cleaned up by `detach`.
    pub fn broadcast(&self, room: &RoomName, msg: &T) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };
        members
            .iter()
            .filter_map(|conn| self.outboxes.get(conn))
            .filter(|outbox| outbox.send(msg.clone()).is_ok())
            .count()
    }

    /// Pushes `msg` to a single connection. Returns `false` if the
    /// connection is unknown or its task has exited.
    pub fn send_to(&self, conn: ConnectionId, msg: T) -> bool {
        self.outboxes
            .get(&conn)
            .is_some_and(|outbox| outbox.send(msg).is_ok())
    }

    /// Members of `room`, in id order.
    pub fn members(&self, room: &RoomName) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .rooms
            .get(room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Rooms `conn` is in, in name order.
    pub fn rooms_of(&self, conn: ConnectionId) -> Vec<RoomName> {
        self.memberships
            .get(&conn)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, conn: ConnectionId, room: &RoomName) -> bool {
        self.memberships
            .get(&conn)
            .is_some_and(|joined| joined.contains(room))
    }

    /// Rooms with at least one member.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Attached connections.
    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    fn drop_member(&mut self, room: &RoomName, conn: ConnectionId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&conn);
            if members.is_empty() {
                self.rooms.remove(room);
                tracing::debug!(%room, "room emptied");
            }
        }
    }
}

impl<T: Clone> Default for RoomRegistry<T> {
    fn default() -> Self {
        Self::new(RoomConfig::default())
    }
}
