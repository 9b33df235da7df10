//! Error types for the protocol layer.
//!
//! Each crate in Tether defines its own error enum, so a `ProtocolError`
//! always means the problem is in encoding/decoding, not in networking
//! or authentication.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, missing required fields,
    /// unknown message tags, or truncated frames.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message is invalid at the protocol level.
    ///
    /// For logical errors that pass deserialization but violate
    /// protocol rules, e.g. a first frame that is not a handshake.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
