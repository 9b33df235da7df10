//! Core protocol types for Tether's wire format.
//!
//! Every type in this module travels "on the wire": it is serialized to
//! bytes, sent over the connection, and deserialized on the other side.
//! Both the server gate and the client engine depend on these shapes, so
//! changing a serde attribute here is a protocol change.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// The current protocol version. Clients must send this in their
/// handshake or be rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Milliseconds since the Unix epoch, used for `auth_error` timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch, the unit of a credential's `exp` claim.
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The name of a logical broadcast channel, e.g. `route:R1`.
///
/// A newtype around `String` so a room name can't be passed where an
/// event name or a subject id is expected. `#[serde(transparent)]` keeps
/// the wire form a plain JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomName(pub String);

impl RoomName {
    /// Creates a room name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for RoomName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Identity claims carried by a credential: who the subject is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identity {
    /// Subject id (the user).
    pub id: String,
    /// Role, e.g. `driver` or `dispatcher`.
    pub role: String,
    /// Display name.
    pub username: String,
}

/// The claim set inside a bearer credential.
///
/// `exp` and `iat` are Unix seconds, matching the JWT registered claims.
/// The gate is the only component that trusts these after verifying the
/// signature; the client reads them unverified to schedule renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject id.
    pub sub: String,
    /// Role of the subject.
    #[serde(default)]
    pub role: String,
    /// Display name of the subject.
    #[serde(default)]
    pub username: String,
    /// Expiry instant (Unix seconds).
    pub exp: u64,
    /// Issued-at instant (Unix seconds).
    #[serde(default)]
    pub iat: u64,
}

impl Claims {
    /// Returns the identity part of the claim set.
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.sub.clone(),
            role: self.role.clone(),
            username: self.username.clone(),
        }
    }

    /// Returns `true` if `exp` is at or before `now_secs`.
    pub fn is_expired_at(&self, now_secs: u64) -> bool {
        self.exp <= now_secs
    }
}

/// The auth payload a client presents in its handshake.
///
/// `role`, `id` and `username` ride along for convenience (they key
/// diagnostics before the token is decoded); the token stays
/// authoritative for every decision.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HandshakeAuth {
    /// Bearer credential.
    pub token: Option<String>,
    /// Claimed role.
    #[serde(default)]
    pub role: Option<String>,
    /// Claimed subject id.
    #[serde(default)]
    pub id: Option<String>,
    /// Claimed display name.
    #[serde(default)]
    pub username: Option<String>,
}

// ---------------------------------------------------------------------------
// Auth error taxonomy
// ---------------------------------------------------------------------------

/// Why a credential was not accepted.
///
/// Serialized in SCREAMING_SNAKE_CASE (`"TOKEN_EXPIRED"`) because that is
/// what existing browser clients match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthErrorKind {
    /// Well-formed but expired. Recoverable in place: a grace window is
    /// open and a `reauthenticate` with a fresh token clears it.
    TokenExpired,
    /// Malformed or signed with the wrong key. Unrecoverable: the
    /// connection is already closing and the user must log in again.
    InvalidToken,
    /// Anything else (missing token, validator failure). Treated as
    /// unrecoverable.
    AuthError,
}

impl AuthErrorKind {
    /// Numeric code sent alongside the kind.
    pub fn code(self) -> u16 {
        match self {
            Self::TokenExpired => 4001,
            Self::InvalidToken => 4002,
            Self::AuthError => 4003,
        }
    }

    /// `true` only for errors that re-authentication can fix without
    /// dropping the connection.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::TokenExpired)
    }

    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::AuthError => "AUTH_ERROR",
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Disconnect reasons
// ---------------------------------------------------------------------------

/// Why a connection ended.
///
/// The client decides whether to reconnect from this alone, so every
/// server-initiated close carries a reason distinct from the voluntary
/// client one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The client asked to disconnect. Never followed by auto-reconnect.
    #[serde(rename = "io client disconnect")]
    ClientDisconnect,
    /// The server closed the connection on purpose.
    #[serde(rename = "io server disconnect")]
    ServerDisconnect,
    /// The grace window after `TOKEN_EXPIRED` elapsed without a
    /// successful re-authentication.
    #[serde(rename = "auth grace expired")]
    AuthGraceExpired,
    /// The credential was refused, as `INVALID_TOKEN` or `AUTH_ERROR`.
    /// This one reason covers every refusal; the preceding `auth_error`
    /// says which kind it was.
    #[serde(rename = "invalid token")]
    InvalidToken,
    /// No frame arrived within the idle timeout.
    #[serde(rename = "ping timeout")]
    PingTimeout,
    /// The socket closed without a `disconnect` message.
    #[serde(rename = "transport close")]
    TransportClose,
    /// The socket failed.
    #[serde(rename = "transport error")]
    TransportError,
}

impl DisconnectReason {
    /// `true` when the client itself chose to disconnect.
    pub fn is_voluntary(self) -> bool {
        matches!(self, Self::ClientDisconnect)
    }

    /// `true` when the credential itself was refused; reconnecting with
    /// it cannot succeed.
    pub fn requires_login(self) -> bool {
        matches!(self, Self::InvalidToken)
    }

    /// Wire string of the reason.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientDisconnect => "io client disconnect",
            Self::ServerDisconnect => "io server disconnect",
            Self::AuthGraceExpired => "auth grace expired",
            Self::InvalidToken => "invalid token",
            Self::PingTimeout => "ping timeout",
            Self::TransportClose => "transport close",
            Self::TransportError => "transport error",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SystemMessage: engine-level messages
// ---------------------------------------------------------------------------

/// Messages used by the engine itself.
///
/// `#[serde(tag = "type", rename_all = "snake_case")]` produces internally
/// tagged JSON: `{ "type": "reauthenticate", "token": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemMessage {
    // -- Connection lifecycle --
    /// Client → Server: open the session with a credential.
    Handshake { version: u32, auth: HandshakeAuth },

    /// Server → Client: connection accepted (possibly transiently, in
    /// which case an `auth_error` follows immediately).
    HandshakeAck {
        connection_id: u64,
        identity: Identity,
        server_time: u64,
    },

    /// Either direction: "I'm disconnecting, and here is why."
    Disconnect { reason: DisconnectReason },

    // -- Authentication --
    /// Client → Server: replace the connection's credential.
    Reauthenticate { token: String },

    /// Server → Client: the new credential was accepted.
    Reauthenticated { identity: Identity },

    /// Server → Client: a credential was not accepted.
    ///
    /// `grace_ms` is set only for `TOKEN_EXPIRED` while a grace window
    /// is open, and tells the client how long it has to re-authenticate.
    AuthError {
        kind: AuthErrorKind,
        message: String,
        code: u16,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grace_ms: Option<u64>,
    },

    // -- Heartbeat --
    /// Client → Server: keep-alive.
    Heartbeat { client_time: u64 },

    /// Server → Client: keep-alive echo.
    HeartbeatAck { client_time: u64, server_time: u64 },

    // -- Rooms --
    /// Client → Server: subscribe to a room.
    Join { room: RoomName },

    /// Server → Client: subscribed.
    Joined { room: RoomName },

    /// Client → Server: unsubscribe from a room.
    Leave { room: RoomName },

    /// Server → Client: unsubscribed.
    Left { room: RoomName },

    // -- Errors --
    /// Server → Client: a non-auth failure (bad frame, unknown message).
    Error { code: u16, message: String },
}

// ---------------------------------------------------------------------------
// Payload / Envelope
// ---------------------------------------------------------------------------

/// A domain event fanned out to a room. `data` is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEvent {
    /// Room the event targets.
    pub room: RoomName,
    /// Event name, e.g. `stop_updated`. Subscribers key on this.
    pub name: String,
    /// Opaque payload bytes.
    pub data: Vec<u8>,
}

/// The content of a message: either an engine message or a room event.
///
/// Adjacently tagged: `{ "type": "System", "data": { ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    /// Engine-level message.
    System(SystemMessage),
    /// Opaque room broadcast.
    Event(RoomEvent),
}

/// The top-level message wrapper. Every frame on the wire is an Envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-direction sequence number.
    pub seq: u64,
    /// Milliseconds since the Unix epoch when the sender built the frame.
    pub timestamp: u64,
    /// The message content.
    pub payload: Payload,
}

impl Envelope {
    /// Wraps a system message.
    pub fn system(seq: u64, timestamp: u64, msg: SystemMessage) -> Self {
        Self {
            seq,
            timestamp,
            payload: Payload::System(msg),
        }
    }

    /// Wraps a room event.
    pub fn event(seq: u64, timestamp: u64, event: RoomEvent) -> Self {
        Self {
            seq,
            timestamp,
            payload: Payload::Event(event),
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
