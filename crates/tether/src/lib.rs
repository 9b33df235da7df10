//! # Tether
//!
//! Authenticated, self-healing real-time connections over WebSocket.
//!
//! The server side admits each connection through a credential gate,
//! keeps it open through a bounded grace window when the credential
//! expires, and fans room events out to subscribers. The client side
//! renews credentials before they lapse, re-authenticates in place,
//! reconnects with backoff, and rejoins its rooms.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::prelude::*;
//!
//! # async fn run() -> Result<(), TetherError> {
//! let server = TetherServerBuilder::new()
//!     .bind("0.0.0.0:8080")
//!     .build(JwtKeys::from_secret(b"secret"))
//!     .await?;
//!
//! let broadcaster = server.broadcaster();
//! tokio::spawn(server.run());
//!
//! broadcaster
//!     .broadcast("route:R1", "route_updated", br#"{"eta":12}"#.to_vec())
//!     .await;
//! # Ok(())
//! # }
//! ```

mod broadcaster;
mod config;
mod error;
mod handler;
mod server;
mod telemetry;

pub use broadcaster::Broadcaster;
pub use config::{ServerConfig, TetherConfig};
pub use error::TetherError;
pub use server::{TetherServer, TetherServerBuilder};
pub use telemetry::init_tracing;

pub use tether_backoff as backoff;
pub use tether_client as client;
pub use tether_gate as gate;
pub use tether_protocol as protocol;
pub use tether_room as room;
pub use tether_transport as transport;

/// Everything needed to run a server or a client.
pub mod prelude {
    pub use crate::{
        Broadcaster, ServerConfig, TetherConfig, TetherError, TetherServer, TetherServerBuilder,
        init_tracing,
    };
    pub use tether_backoff::BackoffConfig;
    pub use tether_client::{
        ClientConfig, ClientEvent, ConnectionState, Credential, CredentialRenewer,
        CredentialStore, GuardConfig, HttpRenewer, MemoryCredentialStore, Subscription,
        TerminalError, TetherClient,
    };
    pub use tether_gate::{GateConfig, JwtKeys, TokenValidator, TokenVerdict};
    pub use tether_protocol::{
        AuthErrorKind, Claims, DisconnectReason, Identity, RoomEvent, RoomName,
    };
    pub use tether_room::RoomConfig;
    pub use tether_transport::ConnectionId;
}
