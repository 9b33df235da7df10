//! Self-healing authenticated client connection for Tether.
//!
//! A [`TetherClient`] keeps one WebSocket connection to a Tether server
//! open and authorized for as long as it's wanted:
//!
//! - the [`CredentialGuard`] renews the bearer credential before it lapses,
//!   with at most one renewal in flight;
//! - the [`ConnectionMachine`] decides what happens on every auth error
//!   and disconnect (re-auth in place, back off and redial, or stop and
//!   ask for a login);
//! - the [`RoomTracker`] rejoins every room after each (re)connection;
//! - the [`EventRegistry`] delivers events to subscribers, coalescing
//!   bursts.
//!
//! ```text
//!  TetherClient (handle) ──commands──→ Driver task ──→ WebSocket
//!         ↑                              │  ↑
//!    watch<ConnectionState>     machine ─┘  └─ guard ──→ CredentialRenewer
//! ```

#![allow(async_fn_in_trait)]

mod client;
mod config;
mod credential;
mod driver;
mod error;
mod guard;
mod machine;
mod registry;
mod renewer;
mod rooms;
mod store;

pub use client::{TetherClient, TetherClientBuilder};
pub use config::ClientConfig;
pub use credential::Credential;
pub use error::{ClientError, CredentialError, GuardError};
pub use guard::{CredentialGuard, GuardConfig};
pub use machine::{Action, ClientEvent, ConnectionMachine, ConnectionState, TerminalError};
pub use registry::{EventRegistry, Handler, Subscription};
pub use renewer::{CredentialRenewer, HttpRenewer};
pub use rooms::RoomTracker;
pub use store::{CredentialStore, MemoryCredentialStore};
