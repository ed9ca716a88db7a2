//! Relay configuration
//!
//! Loads relay settings from a TOML file such as `relay.toml`:
//!
//! ```toml
//! bind = "0.0.0.0"
//! port = 8000
//! static_root = "."
//! dashboard_path = "../data/dashboard.html"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default route for WebSocket upgrades
pub const DEFAULT_WS_ROUTE: &str = "/ws";
/// Default route aliased to the external dashboard file
pub const DEFAULT_DASHBOARD_ROUTE: &str = "/dashboard.html";
/// Default location of the external dashboard file
pub const DEFAULT_DASHBOARD_PATH: &str = "../data/dashboard.html";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Route must start with '/': {0}")]
    InvalidRoute(String),
    #[error("WebSocket and dashboard routes must differ: {0}")]
    ConflictingRoutes(String),
    #[error("Outbound buffer must hold at least one message")]
    InvalidBuffer,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Directory served at the root path
    pub static_root: PathBuf,
    /// External file served for the dashboard route
    pub dashboard_path: PathBuf,
    /// Route accepting WebSocket upgrades
    pub ws_route: String,
    /// Route aliased to `dashboard_path`
    pub dashboard_route: String,
    /// Messages queued per peer before a broadcast waits on it
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
            static_root: PathBuf::from("."),
            dashboard_path: PathBuf::from(DEFAULT_DASHBOARD_PATH),
            ws_route: DEFAULT_WS_ROUTE.to_string(),
            dashboard_route: DEFAULT_DASHBOARD_ROUTE.to_string(),
            outbound_buffer: 64,
        }
    }
}

/// Command line values that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub static_root: Option<PathBuf>,
    pub dashboard_path: Option<PathBuf>,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from `path`, or fall back to defaults when no path is given
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply command line overrides
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(bind) = overrides.bind {
            self.bind = bind;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(static_root) = overrides.static_root {
            self.static_root = static_root;
        }
        if let Some(dashboard_path) = overrides.dashboard_path {
            self.dashboard_path = dashboard_path;
        }
        self
    }

    /// Check that the routes can be mounted and the buffer is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        for route in [&self.ws_route, &self.dashboard_route] {
            if !route.starts_with('/') {
                return Err(ConfigError::InvalidRoute(route.clone()));
            }
        }
        if self.ws_route == self.dashboard_route {
            return Err(ConfigError::ConflictingRoutes(self.ws_route.clone()));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::InvalidBuffer);
        }
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
