//! Configuration module
//!
//! Loads the relay configuration from an optional TOML file and merges
//! command line overrides on top of it.

mod relay;

pub use relay::*;
