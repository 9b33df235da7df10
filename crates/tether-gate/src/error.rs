//! Error types for the gate layer.

use tether_transport::ConnectionId;

/// Errors that can occur while authenticating connections.
///
/// Note that a rejected credential is NOT an error here: expired and
/// invalid tokens are ordinary [`TokenVerdict`](crate::TokenVerdict)s.
/// These variants cover the cases where no verdict could be reached, or
/// the registry was asked about a connection it doesn't know.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The handshake carried no token at all.
    #[error("no credential presented")]
    MissingToken,

    /// The validator could not reach a verdict (issuer unreachable,
    /// key store unavailable, ...).
    #[error("credential validation unavailable: {0}")]
    ValidatorUnavailable(String),

    /// Signing a credential failed.
    #[error("token issue failed: {0}")]
    Issue(#[source] jsonwebtoken::errors::Error),

    /// No connection with this id is registered.
    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),

    /// A connection with this id is already registered.
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
}
