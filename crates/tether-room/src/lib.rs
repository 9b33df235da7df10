//! Room membership for the Tether server.
//!
//! A room is a named broadcast group. Connections join and leave rooms by
//! name; a room exists exactly as long as it has at least one member.
//! Events published to a room are fanned out to every member's outbox.
//!
//! # Key types
//!
//! - [`RoomRegistry`]: membership table and fan-out
//! - [`Outbox`]: the per-connection channel events are pushed into
//! - [`RoomConfig`]: limits

mod config;
mod error;
mod registry;

pub use config::RoomConfig;
pub use error::RoomError;
pub use registry::{Outbox, RoomRegistry};
