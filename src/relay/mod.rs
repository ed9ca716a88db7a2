//! Relay core
//!
//! Tracks open WebSocket connections and fans text messages out from each
//! sender to every other connected peer.

mod connection;
mod registry;

pub use connection::*;
pub use registry::*;
