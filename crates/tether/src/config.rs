//! File-backed configuration for servers and clients.
//!
//! One TOML file configures both sides. Every section and field is
//! optional:
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:8080"
//! idle_timeout_ms = 30000
//!
//! [gate]
//! grace_period_ms = 10000
//!
//! [client]
//! url = "ws://rt.example.com:8080"
//!
//! [client.backoff]
//! schedule_ms = [1000, 2000, 4000, 8000, 16000]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_client::ClientConfig;
use tether_gate::GateConfig;
use tether_room::RoomConfig;

use crate::TetherError;

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Time allowed between accept and a complete handshake.
    pub handshake_timeout_ms: u64,
    /// A connection that sends nothing for this long is closed with
    /// `ping timeout`. Clients heartbeat well inside it.
    pub idle_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            handshake_timeout_ms: 5_000,
            idle_timeout_ms: 30_000,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub server: ServerConfig,
    pub gate: GateConfig,
    pub rooms: RoomConfig,
    pub client: ClientConfig,
}

impl TetherConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    /// [`TetherError::ConfigParse`] on malformed TOML or mistyped fields.
    pub fn from_toml_str(s: &str) -> Result<Self, TetherError> {
        Ok(toml::from_str(s)?)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    /// [`TetherError::ConfigRead`] if the file can't be read,
    /// [`TetherError::ConfigParse`] if it isn't valid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TetherError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TetherError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_str_empty_is_default() {
        assert_eq!(TetherConfig::from_toml_str("").unwrap(), TetherConfig::default());
    }

    #[test]
    fn test_from_toml_str_partial_sections_keep_defaults() {
        let config = TetherConfig::from_toml_str(
            r#"
            [server]
            bind_addr = "0.0.0.0:9000"

            [gate]
            grace_period_ms = 2500

            [client.backoff]
            schedule_ms = [10, 20]
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.server.idle_timeout_ms, 30_000);
        assert_eq!(config.gate.grace_period(), Duration::from_millis(2_500));
        assert!(config.gate.expiry_watch);
        assert_eq!(config.client.backoff.schedule_ms, vec![10, 20]);
        assert_eq!(config.client.backoff.max_attempts, 2);
        assert_eq!(config.client.coalesce_window_ms, 100);
        assert_eq!(config.rooms, RoomConfig::default());
    }

    #[test]
    fn test_from_toml_str_wrong_type_is_parse_error() {
        let err = TetherConfig::from_toml_str("[server]\nidle_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, TetherError::ConfigParse(_)));
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let err = TetherConfig::load("/nonexistent/tether.toml").unwrap_err();
        assert!(matches!(err, TetherError::ConfigRead { .. }));
    }

    #[test]
    fn test_load_reads_file() {
        let path = std::env::temp_dir().join(format!("tether-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[server]\nhandshake_timeout_ms = 750\n").unwrap();

        let config = TetherConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.server.handshake_timeout(), Duration::from_millis(750));
    }
}
