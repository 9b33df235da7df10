//! Server-side fan-out handle.
//!
//! The [`Hub`] is the one piece of state every connection task shares:
//! who is connected (and as whom) and which rooms they're in. Each task
//! owns its socket, so the hub never writes to sockets directly. It
//! queues [`Outbound`] items on the task's outbox instead.

use std::sync::Arc;

use tether_gate::ConnectionRegistry;
use tether_protocol::{DisconnectReason, RoomEvent, RoomName};
use tether_room::{RoomConfig, RoomRegistry};
use tether_transport::ConnectionId;
use tokio::sync::Mutex;

/// Work queued for a connection task by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    /// Forward a room event to the client.
    Event(RoomEvent),
    /// Tell the client why, then close.
    Close(DisconnectReason),
}

/// Connection and room registries, guarded by one lock so membership and
/// identity never disagree.
pub(crate) struct Hub {
    pub(crate) connections: ConnectionRegistry,
    pub(crate) rooms: RoomRegistry<Outbound>,
}

impl Hub {
    pub(crate) fn new(rooms: RoomConfig) -> Self {
        Self {
            connections: ConnectionRegistry::new(),
            rooms: RoomRegistry::new(rooms),
        }
    }

    /// Forgets a connection entirely.
    pub(crate) fn remove(&mut self, connection_id: ConnectionId) {
        self.connections.remove(connection_id);
        let left = self.rooms.detach(connection_id);
        tracing::debug!(%connection_id, rooms = left.len(), "connection removed from hub");
    }
}

/// Publishes domain events to rooms and closes connections from outside
/// their tasks.
///
/// Cheap to clone; obtain one from
/// [`TetherServer::broadcaster`](crate::TetherServer::broadcaster).
#[derive(Clone)]
pub struct Broadcaster {
    hub: Arc<Mutex<Hub>>,
}

impl Broadcaster {
    pub(crate) fn new(hub: Arc<Mutex<Hub>>) -> Self {
        Self { hub }
    }

    /// Sends `name` with opaque `data` to every connection in `room`.
    /// Returns how many connections it was queued for.
    pub async fn broadcast(
        &self,
        room: impl Into<RoomName>,
        name: impl Into<String>,
        data: Vec<u8>,
    ) -> usize {
        let room = room.into();
        let event = RoomEvent {
            room: room.clone(),
            name: name.into(),
            data,
        };
        let delivered = self.hub.lock().await.rooms.broadcast(&room, &Outbound::Event(event));
        tracing::debug!(%room, delivered, "room broadcast");
        delivered
    }

    /// Closes one connection with `io server disconnect`. Returns `false`
    /// if it is not connected.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        self.hub
            .lock()
            .await
            .rooms
            .send_to(connection_id, Outbound::Close(DisconnectReason::ServerDisconnect))
    }

    /// Closes every connection authenticated as `subject`, e.g. after the
    /// account was logged out elsewhere. Returns how many were closed.
    pub async fn disconnect_subject(&self, subject: &str) -> usize {
        let hub = self.hub.lock().await;
        let closed = hub
            .connections
            .connections_of(subject)
            .into_iter()
            .filter(|id| {
                hub.rooms
                    .send_to(*id, Outbound::Close(DisconnectReason::ServerDisconnect))
            })
            .count();
        tracing::info!(subject, closed, "disconnecting subject");
        closed
    }

    /// Number of authenticated (or in-grace) connections.
    pub async fn connection_count(&self) -> usize {
        self.hub.lock().await.connections.len()
    }

    /// Connections authenticated as `subject`, in id order.
    pub async fn connections_of(&self, subject: &str) -> Vec<ConnectionId> {
        self.hub.lock().await.connections.connections_of(subject)
    }

    /// Connections currently in `room`.
    pub async fn members(&self, room: impl Into<RoomName>) -> Vec<ConnectionId> {
        self.hub.lock().await.rooms.members(&room.into())
    }

    /// Connections inside a grace window.
    pub async fn in_grace(&self) -> Vec<ConnectionId> {
        self.hub.lock().await.connections.in_grace()
    }
}
