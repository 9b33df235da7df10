//! Per-connection handler: handshake, credential gate, and message routing.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive Handshake → check version, validate the credential
//!   2. Admitted (possibly into a grace window) → register, send HandshakeAck
//!   3. Loop: whichever comes first of a client frame, a queued outbound
//!      item, the gate's deadline, or the idle timeout

use std::sync::Arc;
use std::time::Duration;

use tether_gate::{
    Admission, ConnectionGate, ConnectionStatus, DeadlineOutcome, GateError, Reauth,
    TokenValidator, TokenVerdict,
};
use tether_protocol::{
    AuthErrorKind, Codec, DisconnectReason, Envelope, Identity, PROTOCOL_VERSION, Payload,
    ProtocolError, RoomEvent, SystemMessage, unix_millis,
};
use tether_room::Outbox;
use tether_transport::{Connection, ConnectionId, TransportError, WebSocketConnection};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{self, Instant};

use crate::TetherError;
use crate::broadcaster::{Hub, Outbound};
use crate::server::ServerState;

const EXPIRED_MESSAGE: &str = "credential expired; re-authenticate to stay connected";

/// Drop guard that removes a connection from the hub when the handler
/// exits.
///
/// This ensures cleanup happens even if the handler panics. Since `Drop`
/// is synchronous, we spawn a fire-and-forget task for the async lock.
struct HubGuard {
    connection_id: ConnectionId,
    hub: Arc<Mutex<Hub>>,
}

impl Drop for HubGuard {
    fn drop(&mut self) {
        let connection_id = self.connection_id;
        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            hub.lock().await.remove(connection_id);
        });
    }
}

/// A handshake that got past the gate.
struct Admitted {
    identity: Identity,
    /// Set when the credential was already expired.
    grace: Option<Duration>,
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<V, C>(
    conn: WebSocketConnection,
    state: Arc<ServerState<V, C>>,
) -> Result<(), TetherError>
where
    V: TokenValidator,
    C: Codec,
{
    let connection_id = conn.id();
    tracing::debug!(%connection_id, peer = ?conn.peer_addr(), "handling new connection");

    let mut session = Session::new(conn, state);

    // --- Step 1: Handshake ---
    let Some(admitted) = session.handshake().await? else {
        return Ok(());
    };

    // --- Step 2: Register, then acknowledge ---
    let (outbox, mut inbox) = mpsc::unbounded_channel();
    let _guard = session.register(&admitted, outbox).await?;
    session.acknowledge(admitted).await?;

    // --- Step 3: Message loop ---
    session.run(&mut inbox).await

    // _guard drops here → hub removal fires.
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session<V: TokenValidator, C: Codec> {
    conn: WebSocketConnection,
    connection_id: ConnectionId,
    state: Arc<ServerState<V, C>>,
    gate: ConnectionGate,
    seq: u64,
    /// Key for rate-limited rejection logs: the peer IP until a verified
    /// credential names a subject. The handshake `id` is never used since
    /// nothing vouches for it.
    source: String,
}

impl<V, C> Session<V, C>
where
    V: TokenValidator,
    C: Codec,
{
    fn new(conn: WebSocketConnection, state: Arc<ServerState<V, C>>) -> Self {
        let source = conn
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".into());
        Self {
            connection_id: conn.id(),
            gate: ConnectionGate::new(&state.gate),
            conn,
            state,
            seq: 0,
            source,
        }
    }

    /// Receives the Handshake and runs the credential through the gate.
    ///
    /// Returns `None` if the credential was refused; the client has
    /// already been told why and the socket is closed.
    async fn handshake(&mut self) -> Result<Option<Admitted>, TetherError> {
        let data = match time::timeout(self.state.config.handshake_timeout(), self.conn.recv()).await
        {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                return Err(
                    TransportError::ConnectionClosed("closed during handshake".into()).into(),
                );
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(ProtocolError::InvalidMessage("handshake timed out".into()).into());
            }
        };

        let envelope: Envelope = match self.state.codec.decode(&data) {
            Ok(env) => env,
            Err(e) => {
                self.send_error(400, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        let (version, auth) = match envelope.payload {
            Payload::System(SystemMessage::Handshake { version, auth }) => (version, auth),
            _ => {
                self.send_error(400, "expected handshake").await?;
                return Err(ProtocolError::InvalidMessage("expected handshake".into()).into());
            }
        };

        if version != PROTOCOL_VERSION {
            let message =
                format!("unsupported protocol version {version}, server speaks {PROTOCOL_VERSION}");
            self.send_error(400, &message).await?;
            return Err(ProtocolError::InvalidMessage(message).into());
        }

        let verdict = self.validate(auth.token.as_deref()).await;
        if let Some(claims) = verdict.as_ref().ok().and_then(TokenVerdict::claims) {
            if auth.id.as_deref().is_some_and(|id| id != claims.sub) {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    claimed = ?auth.id,
                    sub = %claims.sub,
                    "handshake id differs from credential subject; using the credential"
                );
            }
            self.source = claims.sub.clone();
        }

        match self.gate.admit(verdict, now()) {
            Admission::Accepted(identity) => Ok(Some(Admitted {
                identity,
                grace: None,
            })),
            Admission::Grace { identity, grace } => Ok(Some(Admitted {
                identity,
                grace: Some(grace),
            })),
            // Every refused credential closes as "invalid token", whether
            // the kind was INVALID_TOKEN or AUTH_ERROR. The auth_error frame
            // sent first carries the distinction.
            Admission::Refused { kind, message } => {
                self.state.throttle.report(&self.source, kind, &message);
                self.send_auth_error(kind, &message, None).await?;
                self.close(DisconnectReason::InvalidToken).await;
                Ok(None)
            }
        }
    }

    /// Adds the connection to the hub. The returned guard removes it again.
    async fn register(
        &self,
        admitted: &Admitted,
        outbox: Outbox<Outbound>,
    ) -> Result<HubGuard, TetherError> {
        let status = if admitted.grace.is_some() {
            ConnectionStatus::Grace
        } else {
            ConnectionStatus::Authorized
        };

        let mut hub = self.state.hub.lock().await;
        hub.connections.register(
            self.connection_id,
            admitted.identity.clone(),
            status,
            self.gate.last_valid_at(),
        )?;
        let guard = HubGuard {
            connection_id: self.connection_id,
            hub: Arc::clone(&self.state.hub),
        };
        hub.rooms.attach(self.connection_id, outbox)?;
        Ok(guard)
    }

    async fn acknowledge(&mut self, admitted: Admitted) -> Result<(), TetherError> {
        tracing::info!(
            connection_id = %self.connection_id,
            subject = %admitted.identity.id,
            role = %admitted.identity.role,
            in_grace = admitted.grace.is_some(),
            "connection authenticated"
        );

        self.send_system(SystemMessage::HandshakeAck {
            connection_id: self.connection_id.into_inner(),
            identity: admitted.identity,
            server_time: unix_millis(),
        })
        .await?;

        if let Some(grace) = admitted.grace {
            self.state
                .throttle
                .report(&self.source, AuthErrorKind::TokenExpired, EXPIRED_MESSAGE);
            self.send_auth_error(AuthErrorKind::TokenExpired, EXPIRED_MESSAGE, Some(grace))
                .await?;
        }
        Ok(())
    }

    async fn run(
        &mut self,
        inbox: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> Result<(), TetherError> {
        let idle = self.state.config.idle_timeout();
        let mut idle_deadline = Instant::now() + idle;

        loop {
            let gate_deadline = self.gate.next_deadline().map(Instant::from_std);

            tokio::select! {
                frame = self.conn.recv() => match frame {
                    Ok(Some(data)) => {
                        idle_deadline = Instant::now() + idle;
                        if self.on_frame(&data).await? {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!(connection_id = %self.connection_id, "connection closed cleanly");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(connection_id = %self.connection_id, error = %e, "recv error");
                        break;
                    }
                },
                outbound = inbox.recv() => match outbound {
                    Some(Outbound::Event(event)) => self.send_event(event).await?,
                    Some(Outbound::Close(reason)) => {
                        tracing::info!(connection_id = %self.connection_id, %reason, "closing on request");
                        self.close(reason).await;
                        break;
                    }
                    None => break,
                },
                () = sleep_until(gate_deadline) => {
                    if self.on_gate_deadline().await? {
                        break;
                    }
                }
                () = time::sleep_until(idle_deadline) => {
                    tracing::info!(connection_id = %self.connection_id, "connection timed out");
                    self.close(DisconnectReason::PingTimeout).await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Returns `true` if the connection should close.
    async fn on_frame(&mut self, data: &[u8]) -> Result<bool, TetherError> {
        let envelope: Envelope = match self.state.codec.decode(data) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(
                    connection_id = %self.connection_id, error = %e, "failed to decode envelope"
                );
                self.send_error(400, &e.to_string()).await?;
                return Ok(false);
            }
        };

        match envelope.payload {
            Payload::System(msg) => self.on_system(msg).await,
            Payload::Event(event) => {
                tracing::debug!(
                    connection_id = %self.connection_id, room = %event.room, "client tried to publish"
                );
                self.send_error(403, "clients cannot publish room events").await?;
                Ok(false)
            }
        }
    }

    /// Returns `true` if the connection should close.
    async fn on_system(&mut self, msg: SystemMessage) -> Result<bool, TetherError> {
        match msg {
            SystemMessage::Heartbeat { client_time } => {
                self.send_system(SystemMessage::HeartbeatAck {
                    client_time,
                    server_time: unix_millis(),
                })
                .await?;
            }

            SystemMessage::Reauthenticate { token } => {
                return self.reauthenticate(&token).await;
            }

            SystemMessage::Join { room } => {
                let joined = self
                    .state
                    .hub
                    .lock()
                    .await
                    .rooms
                    .join(self.connection_id, room.clone());
                match joined {
                    Ok(_) => self.send_system(SystemMessage::Joined { room }).await?,
                    Err(e) => self.send_error(400, &e.to_string()).await?,
                }
            }

            SystemMessage::Leave { room } => {
                self.state
                    .hub
                    .lock()
                    .await
                    .rooms
                    .leave(self.connection_id, &room);
                self.send_system(SystemMessage::Left { room }).await?;
            }

            SystemMessage::Disconnect { reason } => {
                tracing::info!(connection_id = %self.connection_id, %reason, "client disconnected");
                self.gate.close();
                let _ = self.conn.close().await;
                return Ok(true);
            }

            SystemMessage::Handshake { .. } => {
                self.send_error(400, "already connected").await?;
            }

            other => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    message = ?other,
                    "ignoring server-bound message from client"
                );
            }
        }
        Ok(false)
    }

    /// Returns `true` if the connection should close.
    async fn reauthenticate(&mut self, token: &str) -> Result<bool, TetherError> {
        let verdict = self.validate(Some(token)).await;

        match self.gate.reauthenticate(verdict, now()) {
            Reauth::Renewed(identity) => {
                self.state.hub.lock().await.connections.update_identity(
                    self.connection_id,
                    identity.clone(),
                    self.gate.last_valid_at(),
                )?;
                tracing::info!(
                    connection_id = %self.connection_id,
                    subject = %identity.id,
                    "re-authenticated"
                );
                self.source = identity.id.clone();
                self.send_system(SystemMessage::Reauthenticated { identity })
                    .await?;
                Ok(false)
            }
            Reauth::Rejected {
                kind,
                message,
                grace_remaining,
            } => {
                self.state.throttle.report(&self.source, kind, &message);
                self.send_auth_error(kind, &message, grace_remaining).await?;
                Ok(false)
            }
            Reauth::Revoked { message } => {
                self.state
                    .throttle
                    .report(&self.source, AuthErrorKind::InvalidToken, &message);
                self.send_auth_error(AuthErrorKind::InvalidToken, &message, None)
                    .await?;
                self.close(DisconnectReason::InvalidToken).await;
                Ok(true)
            }
        }
    }

    /// Returns `true` if the connection should close.
    async fn on_gate_deadline(&mut self) -> Result<bool, TetherError> {
        match self.gate.on_deadline(now()) {
            DeadlineOutcome::Idle => Ok(false),
            DeadlineOutcome::GraceStarted { grace } => {
                self.state
                    .hub
                    .lock()
                    .await
                    .connections
                    .set_status(self.connection_id, ConnectionStatus::Grace)?;
                self.state
                    .throttle
                    .report(&self.source, AuthErrorKind::TokenExpired, EXPIRED_MESSAGE);
                self.send_auth_error(AuthErrorKind::TokenExpired, EXPIRED_MESSAGE, Some(grace))
                    .await?;
                Ok(false)
            }
            DeadlineOutcome::GraceElapsed => {
                tracing::info!(
                    connection_id = %self.connection_id,
                    source = %self.source,
                    "grace period elapsed without re-authentication"
                );
                self.close(DisconnectReason::AuthGraceExpired).await;
                Ok(true)
            }
        }
    }

    async fn validate(&self, token: Option<&str>) -> Result<TokenVerdict, GateError> {
        match token {
            Some(token) if !token.is_empty() => self.state.validator.validate(token).await,
            _ => Err(GateError::MissingToken),
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    async fn send_system(&mut self, msg: SystemMessage) -> Result<(), TetherError> {
        let envelope = Envelope::system(next_seq(&mut self.seq), unix_millis(), msg);
        let bytes = self.state.codec.encode(&envelope)?;
        self.conn.send(&bytes).await?;
        Ok(())
    }

    async fn send_event(&mut self, event: RoomEvent) -> Result<(), TetherError> {
        let envelope = Envelope::event(next_seq(&mut self.seq), unix_millis(), event);
        let bytes = self.state.codec.encode(&envelope)?;
        self.conn.send(&bytes).await?;
        Ok(())
    }

    /// Sends a SystemMessage::Error envelope to the client.
    async fn send_error(&mut self, code: u16, message: &str) -> Result<(), TetherError> {
        self.send_system(SystemMessage::Error {
            code,
            message: message.to_string(),
        })
        .await
    }

    async fn send_auth_error(
        &mut self,
        kind: AuthErrorKind,
        message: &str,
        grace: Option<Duration>,
    ) -> Result<(), TetherError> {
        self.send_system(SystemMessage::AuthError {
            kind,
            message: message.to_string(),
            code: kind.code(),
            timestamp: unix_millis(),
            grace_ms: grace.map(|g| g.as_millis() as u64),
        })
        .await
    }

    /// Tells the client why, then closes the socket. Best effort: the
    /// peer may already be gone.
    async fn close(&mut self, reason: DisconnectReason) {
        self.gate.close();
        if let Err(e) = self.send_system(SystemMessage::Disconnect { reason }).await {
            tracing::debug!(connection_id = %self.connection_id, error = %e, "disconnect notice not sent");
        }
        if let Err(e) = self.conn.close().await {
            tracing::debug!(connection_id = %self.connection_id, error = %e, "close failed");
        }
    }
}

/// Gate clock reading. Taken from Tokio's clock so paused-time tests move
/// the gate too.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Increments and returns the next sequence number.
fn next_seq(seq: &mut u64) -> u64 {
    let current = *seq;
    *seq += 1;
    current
}
