//! Gate configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts and limits for the authentication gate.
///
/// Every field has a default, so a config file only needs to name what it
/// changes:
///
/// ```toml
/// [gate]
/// grace_period_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// How long a connection whose credential has expired may stay open
    /// while the client renews. Default: 10 seconds.
    pub grace_period_ms: u64,

    /// Window over which identical rejections are logged once.
    /// Default: 60 seconds.
    pub log_window_secs: u64,

    /// When `true`, a connection whose valid credential reaches its `exp`
    /// mid-session is moved into grace, exactly as if it had connected
    /// with an expired one. When `false`, credentials are only checked at
    /// handshake and re-authentication.
    pub expiry_watch: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10_000,
            log_window_secs: 60,
            expiry_watch: true,
        }
    }
}

impl GateConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn log_window(&self) -> Duration {
        Duration::from_secs(self.log_window_secs)
    }

    /// Builder-style setter for the grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = grace.as_millis() as u64;
        self
    }

    /// Builder-style setter for the log window.
    pub fn with_log_window(mut self, window: Duration) -> Self {
        self.log_window_secs = window.as_secs();
        self
    }
}
