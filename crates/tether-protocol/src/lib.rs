//! Wire protocol for Tether.
//!
//! This crate defines the "language" that clients and the server speak:
//!
//! - **Types** ([`Envelope`], [`SystemMessage`], [`AuthErrorKind`],
//!   [`DisconnectReason`], etc.): the structures that travel on the wire.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how those messages
//!   are converted to/from bytes.
//! - **Errors** ([`ProtocolError`]): what can go wrong during
//!   encoding/decoding.
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Gate / Client (auth state)
//! ```

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{
    AuthErrorKind, Claims, DisconnectReason, Envelope, HandshakeAuth, Identity,
    Payload, RoomEvent, RoomName, SystemMessage, PROTOCOL_VERSION, unix_millis,
    unix_secs,
};
