//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_backoff::BackoffConfig;

use crate::GuardConfig;

/// Everything the client driver needs besides a store and a renewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the server, e.g. `ws://127.0.0.1:8080`.
    pub url: String,
    /// Connect as soon as the client is built.
    pub autostart: bool,
    pub handshake_timeout_ms: u64,
    /// How often to send a heartbeat while connected. Three intervals
    /// without any inbound frame count as a lost connection.
    pub heartbeat_interval_ms: u64,
    /// Trailing-edge coalescing window for event handlers. 0 delivers
    /// every event.
    pub coalesce_window_ms: u64,
    pub guard: GuardConfig,
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".into(),
            autostart: true,
            handshake_timeout_ms: 5_000,
            heartbeat_interval_ms: 10_000,
            coalesce_window_ms: 100,
            guard: GuardConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}
