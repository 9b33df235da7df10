//! Per-connection authentication state.
//!
//! A [`ConnectionGate`] is owned by one connection task. It is pure: it
//! never sleeps or touches the socket. The task feeds it verdicts and
//! clock readings and acts on what comes back.
//!
//! ```text
//!                 valid                      exp reached
//!   Pending ──────────────→ Authorized ─────────────────────→ Grace
//!      │                        ↑                              │  │
//!      │ expired                └──────── valid re-auth ───────┘  │
//!      └──────────────────────────────────────────────→ Grace     │ deadline
//!      │                                                          ↓
//!      └── invalid / missing ──────────────────────────────→ Closed
//! ```
//!
//! Two rules the state machine never breaks:
//!
//! - The grace deadline is set exactly once per grace window. A re-auth
//!   attempt with another expired credential reports `TOKEN_EXPIRED` but
//!   never arms a second timer or pushes the deadline out.
//! - An invalid credential closes the connection immediately, with no
//!   grace, whether it arrives at handshake or on re-auth.

use std::time::{Duration, Instant, SystemTime};

use tether_protocol::{AuthErrorKind, Identity, unix_secs};
use tracing::debug;

use crate::{GateConfig, GateError, TokenVerdict};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Where the gate currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No credential evaluated yet.
    Pending,
    /// Credential valid until `expires_at`. `None` when the expiry lies
    /// beyond what the monotonic clock can represent.
    Authorized { expires_at: Option<Instant> },
    /// Credential expired; the connection is closed at `deadline` unless
    /// the client re-authenticates first.
    Grace { deadline: Instant },
    /// The connection must be (or has been) closed.
    Closed,
}

/// Result of the handshake credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Valid credential.
    Accepted(Identity),
    /// Expired but authentic credential. The connection is admitted and
    /// will be closed after `grace` unless renewed.
    Grace { identity: Identity, grace: Duration },
    /// Refused. Report `kind` to the client, then close.
    Refused { kind: AuthErrorKind, message: String },
}

/// Result of a mid-session re-authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reauth {
    /// Renewed. Any pending grace window is cancelled.
    Renewed(Identity),
    /// Not renewed, but the connection stays open. `grace_remaining` is
    /// the time left on the existing window, if one is running.
    Rejected {
        kind: AuthErrorKind,
        message: String,
        grace_remaining: Option<Duration>,
    },
    /// The presented credential is forged or malformed. Close now.
    Revoked { message: String },
}

/// What happened when the gate's deadline was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineOutcome {
    /// The deadline moved or was cancelled; nothing to do.
    Idle,
    /// A valid credential just expired and a grace window opened.
    GraceStarted { grace: Duration },
    /// The grace window ran out. Force-close the connection.
    GraceElapsed,
}

// ---------------------------------------------------------------------------
// ConnectionGate
// ---------------------------------------------------------------------------

/// Authentication state for a single connection.
#[derive(Debug)]
pub struct ConnectionGate {
    grace: Duration,
    expiry_watch: bool,
    state: GateState,
    identity: Option<Identity>,
    last_valid_at: Option<SystemTime>,
}

impl ConnectionGate {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            grace: config.grace_period(),
            expiry_watch: config.expiry_watch,
            state: GateState::Pending,
            identity: None,
            last_valid_at: None,
        }
    }

    /// Evaluates the handshake credential.
    ///
    /// `verdict` is whatever the validator returned; an `Err` (including
    /// [`GateError::MissingToken`]) is refused as `AUTH_ERROR`.
    pub fn admit(&mut self, verdict: Result<TokenVerdict, GateError>, now: Instant) -> Admission {
        match verdict {
            Ok(TokenVerdict::Valid(claims)) => {
                self.authorize(claims.exp, now);
                let identity = claims.identity();
                self.identity = Some(identity.clone());
                Admission::Accepted(identity)
            }
            Ok(TokenVerdict::Expired(claims)) => {
                self.state = GateState::Grace {
                    deadline: now + self.grace,
                };
                let identity = claims.identity();
                self.identity = Some(identity.clone());
                Admission::Grace {
                    identity,
                    grace: self.grace,
                }
            }
            Ok(TokenVerdict::Invalid(reason)) => {
                self.state = GateState::Closed;
                Admission::Refused {
                    kind: AuthErrorKind::InvalidToken,
                    message: reason,
                }
            }
            Err(e) => {
                self.state = GateState::Closed;
                Admission::Refused {
                    kind: AuthErrorKind::AuthError,
                    message: e.to_string(),
                }
            }
        }
    }

    /// Evaluates a credential presented on an already-open connection.
    pub fn reauthenticate(
        &mut self,
        verdict: Result<TokenVerdict, GateError>,
        now: Instant,
    ) -> Reauth {
        if self.state == GateState::Closed {
            return Reauth::Revoked {
                message: "connection is closing".into(),
            };
        }
        match verdict {
            Ok(TokenVerdict::Valid(claims)) => {
                if matches!(self.state, GateState::Grace { .. }) {
                    debug!(sub = %claims.sub, "grace cancelled by re-auth");
                }
                self.authorize(claims.exp, now);
                let identity = claims.identity();
                self.identity = Some(identity.clone());
                Reauth::Renewed(identity)
            }
            Ok(TokenVerdict::Expired(_)) => Reauth::Rejected {
                kind: AuthErrorKind::TokenExpired,
                message: "presented credential is already expired".into(),
                grace_remaining: self.grace_remaining(now),
            },
            Ok(TokenVerdict::Invalid(reason)) => {
                self.state = GateState::Closed;
                Reauth::Revoked { message: reason }
            }
            Err(e) => Reauth::Rejected {
                kind: AuthErrorKind::AuthError,
                message: e.to_string(),
                grace_remaining: self.grace_remaining(now),
            },
        }
    }

    /// The next instant [`on_deadline`](Self::on_deadline) needs to run,
    /// if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            GateState::Authorized { expires_at } if self.expiry_watch => expires_at,
            GateState::Grace { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Advances the gate to `now`.
    pub fn on_deadline(&mut self, now: Instant) -> DeadlineOutcome {
        match self.state {
            GateState::Authorized {
                expires_at: Some(expires_at),
            } if self.expiry_watch && now >= expires_at => {
                self.state = GateState::Grace {
                    deadline: now + self.grace,
                };
                DeadlineOutcome::GraceStarted { grace: self.grace }
            }
            GateState::Grace { deadline } if now >= deadline => {
                self.state = GateState::Closed;
                DeadlineOutcome::GraceElapsed
            }
            _ => DeadlineOutcome::Idle,
        }
    }

    /// Marks the gate closed. Idempotent.
    pub fn close(&mut self) {
        self.state = GateState::Closed;
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// The identity from the most recent authentic credential.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Wall-clock time of the most recent *valid* credential.
    pub fn last_valid_at(&self) -> Option<SystemTime> {
        self.last_valid_at
    }

    /// `true` while a grace window is running.
    pub fn in_grace(&self) -> bool {
        matches!(self.state, GateState::Grace { .. })
    }

    fn grace_remaining(&self, now: Instant) -> Option<Duration> {
        match self.state {
            GateState::Grace { deadline } => Some(deadline.saturating_duration_since(now)),
            _ => None,
        }
    }

    fn authorize(&mut self, exp: u64, now: Instant) {
        let remaining = Duration::from_secs(exp.saturating_sub(unix_secs()));
        self.state = GateState::Authorized {
            expires_at: now.checked_add(remaining),
        };
        self.last_valid_at = Some(SystemTime::now());
    }
}
