//! Unified error type for Tether.

use std::path::PathBuf;

use tether_client::ClientError;
use tether_gate::GateError;
use tether_protocol::ProtocolError;
use tether_room::RoomError;
use tether_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `tether` meta-crate, you deal with this single error
/// type instead of importing errors from each sub-crate. `#[from]` on each
/// variant lets `?` convert sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// A transport-level error (connection, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Credential validation or connection registry failure.
    #[error(transparent)]
    Gate(#[from] GateError),

    /// A room membership error.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// A client-side failure.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`TetherConfig`](crate::TetherConfig).
    #[error("invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_transport::ConnectionId;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let tether_err: TetherError = err.into();
        assert!(matches!(tether_err, TetherError::Transport(_)));
        assert!(tether_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let tether_err: TetherError = err.into();
        assert!(matches!(tether_err, TetherError::Protocol(_)));
    }

    #[test]
    fn test_from_gate_error() {
        let tether_err: TetherError = GateError::MissingToken.into();
        assert!(matches!(tether_err, TetherError::Gate(_)));
    }

    #[test]
    fn test_from_room_error() {
        let err = RoomError::NotAttached(ConnectionId::new(1));
        let tether_err: TetherError = err.into();
        assert!(matches!(tether_err, TetherError::Room(_)));
    }

    #[test]
    fn test_from_client_error() {
        let tether_err: TetherError = ClientError::Shutdown.into();
        assert!(matches!(tether_err, TetherError::Client(_)));
    }

    #[test]
    fn test_config_read_names_path() {
        let err = TetherError::ConfigRead {
            path: "/etc/tether.toml".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("/etc/tether.toml"));
    }
}
