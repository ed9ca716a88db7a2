//! Relay server module
//!
//! Accepts WebSocket connections for the relay and serves static files
//! alongside them on the same listener.

mod handler;
mod websocket;

pub use websocket::*;
