//! Room configuration.

use serde::{Deserialize, Serialize};

/// Limits for the room registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Rooms a single connection may be in at once. Default: 256.
    pub max_rooms_per_connection: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: 256,
        }
    }
}
