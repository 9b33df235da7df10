//! Server-side authentication gate for Tether.
//!
//! This crate decides whether a connection may stay open:
//!
//! 1. **Validation**: classifying a bearer token as valid, expired or
//!    invalid ([`TokenValidator`], with [`JwtKeys`] as the HS256 default)
//! 2. **Gating**: the per-connection state machine that admits, grants a
//!    grace window, renews, or force-closes ([`ConnectionGate`])
//! 3. **Tracking**: who is connected and in what state
//!    ([`ConnectionRegistry`])
//! 4. **Diagnostics**: rate-limited rejection logging
//!    ([`DiagnosticThrottle`])
//!
//! Nothing here owns a socket or a timer. The server's connection handler
//! drives a gate with verdicts and clock readings.

#![allow(async_fn_in_trait)]

mod config;
mod error;
mod gate;
mod jwt;
mod registry;
mod throttle;
mod validator;

pub use config::GateConfig;
pub use error::GateError;
pub use gate::{Admission, ConnectionGate, DeadlineOutcome, GateState, Reauth};
pub use jwt::JwtKeys;
pub use registry::{ConnectionRecord, ConnectionRegistry, ConnectionStatus};
pub use throttle::DiagnosticThrottle;
pub use validator::{TokenValidator, TokenVerdict};
