//! `TetherServer` builder and accept loop.
//!
//! Ties the layers together: transport → protocol → gate → rooms. Every
//! accepted socket gets its own task running
//! [`handle_connection`](crate::handler::handle_connection).

use std::sync::Arc;

use tether_gate::{DiagnosticThrottle, GateConfig, TokenValidator};
use tether_protocol::{Codec, JsonCodec};
use tether_room::RoomConfig;
use tether_transport::{Transport, WebSocketTransport};
use tokio::sync::Mutex;

use crate::broadcaster::{Broadcaster, Hub};
use crate::handler::handle_connection;
use crate::{ServerConfig, TetherConfig, TetherError};

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<V: TokenValidator, C: Codec> {
    pub(crate) hub: Arc<Mutex<Hub>>,
    pub(crate) validator: V,
    pub(crate) codec: C,
    pub(crate) config: ServerConfig,
    pub(crate) gate: GateConfig,
    pub(crate) throttle: Arc<DiagnosticThrottle>,
}

/// Builder for configuring and starting a Tether server.
///
/// # Example
///
/// ```rust,ignore
/// use tether::prelude::*;
///
/// let server = TetherServerBuilder::new()
///     .bind("0.0.0.0:8080")
///     .build(JwtKeys::from_secret(secret))
///     .await?;
/// let broadcaster = server.broadcaster();
/// server.run().await
/// ```
#[derive(Debug, Clone, Default)]
pub struct TetherServerBuilder {
    server: ServerConfig,
    gate: GateConfig,
    rooms: RoomConfig,
}

impl TetherServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the `server`, `gate` and `rooms` sections of a loaded config.
    pub fn from_config(config: &TetherConfig) -> Self {
        Self {
            server: config.server.clone(),
            gate: config.gate.clone(),
            rooms: config.rooms.clone(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.server.bind_addr = addr.to_string();
        self
    }

    pub fn server_config(mut self, config: ServerConfig) -> Self {
        self.server = config;
        self
    }

    pub fn gate_config(mut self, config: GateConfig) -> Self {
        self.gate = config;
        self
    }

    pub fn room_config(mut self, config: RoomConfig) -> Self {
        self.rooms = config;
        self
    }

    /// Binds the listener. Connections are checked with `validator`.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`.
    pub async fn build<V: TokenValidator>(
        self,
        validator: V,
    ) -> Result<TetherServer<V, JsonCodec>, TetherError> {
        let transport = WebSocketTransport::bind(&self.server.bind_addr).await?;

        let state = Arc::new(ServerState {
            hub: Arc::new(Mutex::new(Hub::new(self.rooms))),
            validator,
            codec: JsonCodec,
            throttle: Arc::new(DiagnosticThrottle::new(self.gate.log_window())),
            config: self.server,
            gate: self.gate,
        });

        Ok(TetherServer { transport, state })
    }
}

/// A bound Tether server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct TetherServer<V: TokenValidator, C: Codec> {
    transport: WebSocketTransport,
    state: Arc<ServerState<V, C>>,
}

impl<V, C> TetherServer<V, C>
where
    V: TokenValidator,
    C: Codec,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// A handle for publishing to rooms and closing connections.
    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster::new(Arc::clone(&self.state.hub))
    }

    /// The shared limiter for credential-rejection logs.
    pub fn diagnostics(&self) -> Arc<DiagnosticThrottle> {
        Arc::clone(&self.state.throttle)
    }

    /// Runs the accept loop until the process is terminated.
    pub async fn run(mut self) -> Result<(), TetherError> {
        tracing::info!(
            addr = ?self.transport.local_addr().ok(),
            grace_ms = self.state.gate.grace_period_ms,
            "Tether server running"
        );

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, state).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}
