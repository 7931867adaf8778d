//! Relay engine.
//!
//! Owns the per-connection lifecycle: accepting charge points, opening the
//! upstream leg, driving the security pipeline on every frame, and the
//! background liveness watchdog.

mod connection;
mod listener;
mod registry;
mod watchdog;

pub use connection::{handle_connection, ConnectionDeps, ENVELOPE_SUBPROTOCOL};
pub use listener::ProxyListener;
pub use registry::{ConnectionContext, ConnectionHandle, ConnectionRegistry};
pub use watchdog::LivenessWatchdog;
