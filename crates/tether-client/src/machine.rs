//! The client connection state machine.
//!
//! [`ConnectionMachine`] is a plain value: every input is a method call,
//! every output is a list of [`Action`]s for the driver to perform. It
//! never touches a socket, a timer or a clock, so every transition is
//! testable in isolation.
//!
//! ```text
//!            start / reconnect()
//!   Idle ─────────────────────────→ Handshaking ──── ack ────→ Authenticated
//!                                     ↑    │                    │       ↑
//!                         retry timer │    │ dial failed        │       │ reauthenticated
//!                                     │    ↓                    ↓       │
//!                                  Reconnecting ←── involuntary close ── Degraded
//!                                          │                (auth_error TOKEN_EXPIRED)
//!                         attempts exhausted / login required / user close
//!                                          ↓
//!                                       Closed
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use tether_backoff::{BackoffConfig, ReconnectBackoff};
use tether_protocol::{AuthErrorKind, DisconnectReason, Identity, RoomEvent};
use tracing::{debug, info, warn};

use crate::GuardError;

/// Re-auth attempts allowed per degraded episode before the client stops
/// asking and lets the grace window run out.
const MAX_REAUTH_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Observable state
// ---------------------------------------------------------------------------

/// Why the client stopped for good. Shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TerminalError {
    /// The credential is gone or rejected. Only a fresh login helps.
    #[error("please log in again")]
    LoginRequired,
    /// Reconnection gave up.
    #[error("connection lost, please refresh")]
    ConnectionLost,
}

/// Lifecycle state of the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started.
    Idle,
    /// Dialing and waiting for the handshake acknowledgement.
    Handshaking,
    /// Connected with a credential the server accepts.
    Authenticated,
    /// Connected, but the server reported an auth error. If the server
    /// granted a grace window, `grace_deadline` is when it closes.
    Degraded { grace_deadline: Option<Instant> },
    /// Waiting `delay` before attempt number `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Stopped. `terminal` is `None` after a voluntary disconnect.
    Closed { terminal: Option<TerminalError> },
}

impl ConnectionState {
    /// `true` while a socket is open and the server has acknowledged it.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Degraded { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Handshaking => "handshaking",
            Self::Authenticated => "authenticated",
            Self::Degraded { .. } => "degraded",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Closed { .. } => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Something subscribers can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected {
        connection_id: u64,
        identity: Identity,
    },
    Reauthenticated {
        identity: Identity,
    },
    AuthError {
        kind: AuthErrorKind,
        message: String,
        grace: Option<Duration>,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    Terminal(TerminalError),
    StateChanged(ConnectionState),
    /// A room event relayed by the server. Its topic is the event name.
    Broadcast(RoomEvent),
}

impl ClientEvent {
    /// Topic subscribers register for.
    pub fn topic(&self) -> &str {
        match self {
            Self::Connected { .. } => "connect",
            Self::Reauthenticated { .. } => "reauthenticated",
            Self::AuthError { .. } => "auth_error",
            Self::Disconnected { .. } => "disconnect",
            Self::Terminal(_) => "terminal",
            Self::StateChanged(_) => "state",
            Self::Broadcast(event) => &event.name,
        }
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// Side effects requested by a transition, in the order to perform them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Obtain a credential, dial, and handshake.
    Open,
    /// Send `join` for every tracked room.
    ReplayRooms,
    /// Force-renew the credential and send `reauthenticate`.
    Reauthenticate,
    /// Arm the retry timer, replacing any pending one.
    ScheduleRetry(Duration),
    CancelRetry,
    /// Tell the server we're leaving and close the socket.
    CloseTransport,
    Emit(ClientEvent),
}

/// Pure connection state machine for one logical client session.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: ReconnectBackoff,
    /// Set by `INVALID_TOKEN` / `AUTH_ERROR`: the next close is terminal.
    login_required: bool,
    reauth_attempts: u32,
}

impl ConnectionMachine {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: ConnectionState::Idle,
            backoff: ReconnectBackoff::new(backoff),
            login_required: false,
            reauth_attempts: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn backoff(&self) -> &ReconnectBackoff {
        &self.backoff
    }

    /// Autostart. Only meaningful from `Idle`.
    pub fn start(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Idle {
            return Vec::new();
        }
        self.state = ConnectionState::Handshaking;
        vec![Action::Open]
    }

    /// User-requested reconnect: starts over with a fresh attempt budget.
    pub fn reconnect(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::CancelRetry];
        match self.state {
            ConnectionState::Handshaking => return Vec::new(),
            ConnectionState::Authenticated | ConnectionState::Degraded { .. } => {
                actions.push(Action::CloseTransport);
            }
            _ => {}
        }
        info!(from = %self.state, "manual reconnect");
        self.backoff.reset();
        self.login_required = false;
        self.reauth_attempts = 0;
        self.state = ConnectionState::Handshaking;
        actions.push(Action::Open);
        actions
    }

    /// The server acknowledged the handshake.
    pub fn connected(&mut self, connection_id: u64, identity: Identity) -> Vec<Action> {
        if self.state != ConnectionState::Handshaking {
            debug!(state = %self.state, "stale handshake ack ignored");
            return Vec::new();
        }
        self.backoff.reset();
        self.login_required = false;
        self.reauth_attempts = 0;
        self.state = ConnectionState::Authenticated;
        vec![
            Action::ReplayRooms,
            Action::Emit(ClientEvent::Connected {
                connection_id,
                identity,
            }),
        ]
    }

    /// The server reported an auth error.
    ///
    /// `grace_deadline` is when the server will close the connection, if
    /// it granted a grace window.
    pub fn auth_error(
        &mut self,
        kind: AuthErrorKind,
        message: String,
        grace_deadline: Option<Instant>,
        now: Instant,
    ) -> Vec<Action> {
        let grace = grace_deadline.map(|d| d.saturating_duration_since(now));
        let mut actions = vec![Action::Emit(ClientEvent::AuthError {
            kind,
            message,
            grace,
        })];

        if !kind.is_recoverable() {
            warn!(%kind, "credential rejected, login required");
            self.login_required = true;
            return actions;
        }
        if !self.state.is_connected() {
            return actions;
        }

        let grace_deadline = match self.state {
            ConnectionState::Degraded {
                grace_deadline: Some(existing),
            } => Some(existing),
            _ => grace_deadline,
        };
        self.state = ConnectionState::Degraded { grace_deadline };

        if self.reauth_attempts < MAX_REAUTH_ATTEMPTS {
            self.reauth_attempts += 1;
            actions.push(Action::Reauthenticate);
        } else {
            debug!("re-auth attempts exhausted, waiting for grace to run out");
        }
        actions
    }

    /// The server accepted a re-auth.
    pub fn reauthenticated(&mut self, identity: Identity) -> Vec<Action> {
        if !self.state.is_connected() {
            return Vec::new();
        }
        self.reauth_attempts = 0;
        self.login_required = false;
        self.state = ConnectionState::Authenticated;
        vec![
            Action::ReplayRooms,
            Action::Emit(ClientEvent::Reauthenticated { identity }),
        ]
    }

    /// The socket closed.
    pub fn disconnected(&mut self, reason: DisconnectReason) -> Vec<Action> {
        if !matches!(
            self.state,
            ConnectionState::Handshaking
                | ConnectionState::Authenticated
                | ConnectionState::Degraded { .. }
        ) {
            return Vec::new();
        }
        info!(%reason, from = %self.state, "disconnected");
        let mut actions = vec![Action::Emit(ClientEvent::Disconnected { reason })];

        if reason.is_voluntary() {
            self.state = ConnectionState::Closed { terminal: None };
        } else if self.login_required || reason.requires_login() {
            actions.extend(self.terminate(TerminalError::LoginRequired));
        } else {
            actions.extend(self.schedule_retry());
        }
        actions
    }

    /// Dialing or the handshake failed before an acknowledgement.
    pub fn connect_failed(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Handshaking {
            return Vec::new();
        }
        if self.login_required {
            return self.terminate(TerminalError::LoginRequired);
        }
        self.schedule_retry()
    }

    /// The retry timer fired.
    pub fn retry_elapsed(&mut self) -> Vec<Action> {
        if !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            return Vec::new();
        }
        self.state = ConnectionState::Handshaking;
        vec![Action::Open]
    }

    /// User-requested disconnect. Suppresses auto-reconnect.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let was_open = matches!(
            self.state,
            ConnectionState::Handshaking
                | ConnectionState::Authenticated
                | ConnectionState::Degraded { .. }
        );
        self.state = ConnectionState::Closed { terminal: None };
        let mut actions = vec![Action::CancelRetry];
        if was_open {
            actions.push(Action::CloseTransport);
            actions.push(Action::Emit(ClientEvent::Disconnected {
                reason: DisconnectReason::ClientDisconnect,
            }));
        }
        actions
    }

    /// The guard could not produce a credential.
    pub fn credential_unavailable(&mut self, error: &GuardError) -> Vec<Action> {
        if matches!(self.state, ConnectionState::Closed { .. }) {
            return Vec::new();
        }
        warn!(%error, "no usable credential");
        let mut actions = Vec::new();
        if self.state.is_connected() {
            actions.push(Action::CloseTransport);
        }
        actions.extend(self.terminate(TerminalError::LoginRequired));
        actions
    }

    fn schedule_retry(&mut self) -> Vec<Action> {
        match self.backoff.next_delay() {
            Ok(delay) => {
                self.state = ConnectionState::Reconnecting {
                    attempt: self.backoff.attempts(),
                    delay,
                };
                vec![Action::ScheduleRetry(delay)]
            }
            Err(exhausted) => {
                warn!(attempts = exhausted.attempts, "reconnection gave up");
                self.terminate(TerminalError::ConnectionLost)
            }
        }
    }

    fn terminate(&mut self, error: TerminalError) -> Vec<Action> {
        self.state = ConnectionState::Closed {
            terminal: Some(error),
        };
        vec![
            Action::CancelRetry,
            Action::Emit(ClientEvent::Terminal(error)),
        ]
    }
}
