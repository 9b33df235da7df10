//! Error types for the client.

use tether_protocol::ProtocolError;
use tether_transport::TransportError;

/// A token could not be read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// Not a decodable JWT, or missing `sub`/`exp`.
    #[error("malformed credential: {0}")]
    Malformed(String),
}

/// The guard could not produce a usable credential.
///
/// Every variant means the same thing to the connection: it cannot
/// authenticate, and the user has to log in again. `Clone` because one
/// renewal result is shared by every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    /// Nothing in the credential store.
    #[error("no credential stored")]
    Missing,

    /// The renewal endpoint refused or failed.
    #[error("credential renewal failed: {0}")]
    Renewal(String),

    /// The renewal endpoint did not answer within `renewal_timeout`.
    #[error("credential renewal timed out")]
    Timeout,

    /// The renewal endpoint answered with something unusable.
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Errors surfaced by the client handle and its driver.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    /// The server answered the handshake with something other than an
    /// acknowledgement.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The driver task has exited; the handle is inert.
    #[error("client has shut down")]
    Shutdown,
}
