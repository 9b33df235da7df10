//! Error types for the room layer.

use tether_protocol::RoomName;
use tether_transport::ConnectionId;

/// Errors that can occur during room operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The connection was never attached, or has already been detached.
    #[error("connection {0} is not attached")]
    NotAttached(ConnectionId),

    /// The connection is already attached.
    #[error("connection {0} is already attached")]
    AlreadyAttached(ConnectionId),

    /// Room names must be non-empty.
    #[error("invalid room name {0:?}")]
    InvalidName(RoomName),

    /// The connection is at its room limit.
    #[error("connection {0} is already in {1} rooms")]
    TooManyRooms(ConnectionId, usize),
}
