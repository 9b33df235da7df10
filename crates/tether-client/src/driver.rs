//! The driver task: performs the I/O the state machine asks for.
//!
//! One driver runs per client. It owns the socket, the retry timer, the
//! room tracker and the machine, and processes everything (user
//! commands, inbound frames, timer ticks) one at a time inside a single
//! `select!` loop. That is what makes the machine single-threaded: no two
//! events are ever applied concurrently, and at most one handshake is in
//! flight.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tether_backoff::RetryTimer;
use tether_protocol::{
    AuthErrorKind, Codec, DisconnectReason, Envelope, HandshakeAuth, Identity, JsonCodec,
    PROTOCOL_VERSION, Payload, RoomName, SystemMessage, unix_millis,
};
use tether_transport::{Connection, TransportError, WebSocketConnection};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::machine::{Action, ClientEvent, ConnectionMachine, ConnectionState};
use crate::{
    ClientConfig, ClientError, Credential, CredentialGuard, CredentialRenewer, CredentialStore,
    EventRegistry, RoomTracker,
};

/// Silent heartbeat intervals before the connection is presumed dead.
const MISSED_HEARTBEATS: u32 = 3;

/// Requests from [`TetherClient`](crate::TetherClient) handles.
#[derive(Debug)]
pub(crate) enum Command {
    Start,
    Join(RoomName),
    Leave(RoomName),
    Reconnect,
    Disconnect,
}

/// How the server answered a handshake.
enum Handshake {
    Accepted {
        connection_id: u64,
        identity: Identity,
    },
    Refused {
        kind: AuthErrorKind,
        message: String,
        reason: DisconnectReason,
    },
}

pub(crate) struct Driver<S, R> {
    config: ClientConfig,
    guard: CredentialGuard<S, R>,
    codec: JsonCodec,
    machine: ConnectionMachine,
    rooms: RoomTracker,
    events: EventRegistry,
    state_tx: watch::Sender<ConnectionState>,
    retry: RetryTimer,
    conn: Option<WebSocketConnection>,
    seq: u64,
    last_inbound: time::Instant,
}

impl<S: CredentialStore, R: CredentialRenewer> Driver<S, R> {
    pub(crate) fn new(
        config: ClientConfig,
        guard: CredentialGuard<S, R>,
        events: EventRegistry,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let machine = ConnectionMachine::new(config.backoff.clone());
        Self {
            config,
            guard,
            codec: JsonCodec,
            machine,
            rooms: RoomTracker::new(),
            events,
            state_tx,
            retry: RetryTimer::new(),
            conn: None,
            seq: 0,
            last_inbound: time::Instant::now(),
        }
    }

    /// Runs until every handle has been dropped.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut heartbeat = time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.config.autostart {
            let actions = self.machine.start();
            self.process(actions).await;
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        let actions = self.machine.disconnect();
                        self.process(actions).await;
                        break;
                    }
                },
                frame = recv_frame(self.conn.as_ref()) => self.on_frame(frame).await,
                () = self.retry.elapsed() => {
                    let actions = self.machine.retry_elapsed();
                    self.process(actions).await;
                }
                _ = heartbeat.tick(), if self.conn.is_some() => self.on_heartbeat().await,
            }
        }
        debug!("client driver stopped");
    }

    // -- inputs --------------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        debug!(?command, "command");
        match command {
            Command::Start => {
                let actions = self.machine.start();
                self.process(actions).await;
            }
            Command::Join(room) => {
                self.rooms.join(room.clone());
                // Re-sent even if already tracked; the server treats a
                // repeated join as a no-op.
                if self.machine.state().is_connected() {
                    self.send(SystemMessage::Join { room }).await;
                }
            }
            Command::Leave(room) => {
                if self.rooms.leave(&room) && self.machine.state().is_connected() {
                    self.send(SystemMessage::Leave { room }).await;
                }
            }
            Command::Reconnect => {
                let actions = self.machine.reconnect();
                self.process(actions).await;
            }
            Command::Disconnect => {
                let actions = self.machine.disconnect();
                self.process(actions).await;
            }
        }
    }

    async fn on_frame(&mut self, frame: Result<Option<Vec<u8>>, TransportError>) {
        let reason = match frame {
            Ok(Some(bytes)) => {
                self.last_inbound = time::Instant::now();
                match self.codec.decode::<Envelope>(&bytes) {
                    Ok(envelope) => self.on_envelope(envelope).await,
                    Err(e) => warn!(error = %e, "undecodable frame skipped"),
                }
                return;
            }
            Ok(None) => DisconnectReason::TransportClose,
            Err(e) => {
                debug!(error = %e, "transport failed");
                DisconnectReason::TransportError
            }
        };
        self.conn = None;
        let actions = self.machine.disconnected(reason);
        self.process(actions).await;
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        let msg = match envelope.payload {
            Payload::Event(event) => {
                self.events.emit(ClientEvent::Broadcast(event));
                return;
            }
            Payload::System(msg) => msg,
        };

        let actions = match msg {
            SystemMessage::AuthError {
                kind,
                message,
                grace_ms,
                ..
            } => {
                let now = Instant::now();
                let deadline = grace_ms.map(|ms| now + Duration::from_millis(ms));
                self.machine.auth_error(kind, message, deadline, now)
            }
            SystemMessage::Reauthenticated { identity } => {
                info!(sub = %identity.id, "re-authenticated");
                self.machine.reauthenticated(identity)
            }
            SystemMessage::Disconnect { reason } => {
                self.drop_connection().await;
                self.machine.disconnected(reason)
            }
            SystemMessage::HeartbeatAck { client_time, .. } => {
                debug!(rtt_ms = unix_millis().saturating_sub(client_time), "heartbeat ack");
                return;
            }
            SystemMessage::Joined { room } => {
                debug!(%room, "joined");
                return;
            }
            SystemMessage::Left { room } => {
                debug!(%room, "left");
                return;
            }
            SystemMessage::Error { code, message } => {
                warn!(code, %message, "server error");
                return;
            }
            other => {
                debug!(?other, "unexpected system message");
                return;
            }
        };
        self.process(actions).await;
    }

    async fn on_heartbeat(&mut self) {
        let silent = self.last_inbound.elapsed();
        if silent >= self.config.heartbeat_interval() * MISSED_HEARTBEATS {
            warn!(silent_ms = silent.as_millis() as u64, "server went silent");
            self.drop_connection().await;
            let actions = self.machine.disconnected(DisconnectReason::PingTimeout);
            self.process(actions).await;
            return;
        }
        self.send(SystemMessage::Heartbeat {
            client_time: unix_millis(),
        })
        .await;
    }

    // -- actions -------------------------------------------------------------

    /// Performs `actions` and everything they lead to, publishing the
    /// state after each step.
    async fn process(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        self.publish_state();
        while let Some(action) = queue.pop_front() {
            let follow_up = self.execute(action).await;
            queue.extend(follow_up);
            self.publish_state();
        }
    }

    async fn execute(&mut self, action: Action) -> Vec<Action> {
        match action {
            Action::Open => return self.open().await,
            Action::ReplayRooms => {
                for room in self.rooms.replay() {
                    self.send(SystemMessage::Join { room }).await;
                }
            }
            Action::Reauthenticate => match self.guard.refresh().await {
                Ok(credential) => {
                    self.send(SystemMessage::Reauthenticate {
                        token: credential.token().to_owned(),
                    })
                    .await;
                }
                Err(e) => return self.machine.credential_unavailable(&e),
            },
            Action::ScheduleRetry(delay) => self.retry.arm(delay),
            Action::CancelRetry => self.retry.cancel(),
            Action::CloseTransport => {
                if self.conn.is_some() {
                    self.send(SystemMessage::Disconnect {
                        reason: DisconnectReason::ClientDisconnect,
                    })
                    .await;
                }
                self.drop_connection().await;
            }
            Action::Emit(event) => {
                self.events.emit(event);
            }
        }
        Vec::new()
    }

    /// Obtains a credential, dials, and handshakes.
    async fn open(&mut self) -> Vec<Action> {
        self.drop_connection().await;

        let credential = match self.guard.ensure_valid().await {
            Ok(credential) => credential,
            Err(e) => return self.machine.credential_unavailable(&e),
        };

        let timeout = self.config.handshake_timeout();
        match time::timeout(timeout, self.handshake(&credential)).await {
            Ok(Ok((conn, Handshake::Accepted { connection_id, identity }))) => {
                info!(connection_id, sub = %identity.id, "connected");
                self.conn = Some(conn);
                self.last_inbound = time::Instant::now();
                self.machine.connected(connection_id, identity)
            }
            Ok(Ok((conn, Handshake::Refused { kind, message, reason }))) => {
                let _ = conn.close().await;
                let mut actions = self.machine.auth_error(kind, message, None, Instant::now());
                actions.extend(self.machine.disconnected(reason));
                actions
            }
            Ok(Err(e)) => {
                warn!(error = %e, url = %self.config.url, "connection attempt failed");
                self.machine.connect_failed()
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "handshake timed out");
                self.machine.connect_failed()
            }
        }
    }

    async fn handshake(
        &mut self,
        credential: &Credential,
    ) -> Result<(WebSocketConnection, Handshake), ClientError> {
        let conn = WebSocketConnection::connect(&self.config.url).await?;

        let identity = credential.identity();
        let hello = SystemMessage::Handshake {
            version: PROTOCOL_VERSION,
            auth: HandshakeAuth {
                token: Some(credential.token().to_owned()),
                role: Some(identity.role),
                id: Some(identity.id),
                username: Some(identity.username),
            },
        };
        let bytes = self.encode(hello)?;
        conn.send(&bytes).await?;

        let mut refusal: Option<(AuthErrorKind, String)> = None;
        loop {
            let Some(bytes) = conn.recv().await? else {
                return match refusal {
                    Some((kind, message)) => Ok((
                        conn,
                        Handshake::Refused {
                            kind,
                            message,
                            reason: DisconnectReason::TransportClose,
                        },
                    )),
                    None => Err(ClientError::Handshake(
                        "server closed the connection during handshake".into(),
                    )),
                };
            };
            let envelope: Envelope = self.codec.decode(&bytes)?;
            match envelope.payload {
                Payload::System(SystemMessage::HandshakeAck {
                    connection_id,
                    identity,
                    ..
                }) => {
                    return Ok((
                        conn,
                        Handshake::Accepted {
                            connection_id,
                            identity,
                        },
                    ));
                }
                Payload::System(SystemMessage::AuthError { kind, message, .. }) => {
                    refusal = Some((kind, message));
                }
                Payload::System(SystemMessage::Disconnect { reason }) => {
                    let (kind, message) = refusal
                        .unwrap_or((AuthErrorKind::AuthError, reason.as_str().to_owned()));
                    return Ok((
                        conn,
                        Handshake::Refused {
                            kind,
                            message,
                            reason,
                        },
                    ));
                }
                Payload::System(SystemMessage::Error { code, message }) => {
                    return Err(ClientError::Handshake(format!("{code}: {message}")));
                }
                _ => debug!("frame before handshake ack ignored"),
            }
        }
    }

    // -- helpers -------------------------------------------------------------

    fn publish_state(&mut self) {
        let state = self.machine.state().clone();
        if *self.state_tx.borrow() == state {
            return;
        }
        debug!(%state, "state changed");
        self.state_tx.send_replace(state.clone());
        self.events.emit(ClientEvent::StateChanged(state));
    }

    fn encode(&mut self, msg: SystemMessage) -> Result<Vec<u8>, ClientError> {
        self.seq += 1;
        let envelope = Envelope::system(self.seq, unix_millis(), msg);
        Ok(self.codec.encode(&envelope)?)
    }

    /// Best-effort send on the current connection. A failure surfaces as a
    /// transport error on the next receive.
    async fn send(&mut self, msg: SystemMessage) {
        if self.conn.is_none() {
            return;
        }
        let bytes = match self.encode(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode message");
                return;
            }
        };
        if let Some(conn) = &self.conn {
            if let Err(e) = conn.send(&bytes).await {
                debug!(error = %e, "send failed");
            }
        }
    }

    async fn drop_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.close().await;
        }
    }
}

/// Next inbound frame, or pending forever while disconnected.
async fn recv_frame(
    conn: Option<&WebSocketConnection>,
) -> Result<Option<Vec<u8>>, TransportError> {
    match conn {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}
