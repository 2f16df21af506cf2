//! Signaling
//!
//! Membership and offer/accept negotiation over a WebSocket per client:
//! - each connection gets a `User-NNNNN` identity and a `welcome`
//! - every join/leave pushes the full identity `list` to everyone
//! - `offer` / `accept` are forwarded to their `to` with `from` stamped

mod handler;
mod protocol;
mod registry;

pub use handler::handle_signaling_ws;
pub use protocol::{ClientIdentity, ControlMessage};
pub use registry::ConnectionRegistry;
