//! Environment-driven settings
//!
//! All runtime configuration comes from the environment. Only the store
//! connection string is mandatory; the listen port and the default target
//! have defaults that are logged when used so a misconfigured deployment is
//! visible in the startup output.

use anyhow::{Context, Result};
use tracing::info;

/// Default listen port when `PORT` is not set.
pub const DEFAULT_PORT: &str = "8003";

/// Default target host when `MPS_HOST` is not set.
pub const DEFAULT_TARGET_HOST: &str = "mps";

/// Default target port when `MPS_PORT` is not set.
pub const DEFAULT_TARGET_PORT: &str = "3000";

/// Default cap on open store connections.
pub const DEFAULT_MAX_DB_CONNECTIONS: u32 = 10;

/// Resolved process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Address the proxy listens on, in `:port` form.
    pub listen_addr: String,
    /// Default target in `host:port` form.
    pub target: String,
    /// Routing-store connection string.
    pub connection_string: String,
    /// Cap on open store connections.
    pub max_db_connections: u32,
}

impl Settings {
    /// Resolve settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error when `MPS_CONNECTION_STRING` is missing or
    /// `MPS_DB_MAX_OPEN_CONNS` is set but not a number.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings through an injectable variable lookup.
    ///
    /// An unset variable and an empty one are treated the same.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let connection_string =
            lookup("MPS_CONNECTION_STRING").context("MPS_CONNECTION_STRING env is not set")?;

        let port = lookup("PORT").unwrap_or_else(|| {
            info!("PORT env is not set, default is {}", DEFAULT_PORT);
            DEFAULT_PORT.to_string()
        });
        let target_host = lookup("MPS_HOST").unwrap_or_else(|| {
            info!("MPS_HOST env is not set, default is {}", DEFAULT_TARGET_HOST);
            DEFAULT_TARGET_HOST.to_string()
        });
        let target_port = lookup("MPS_PORT").unwrap_or_else(|| {
            info!("MPS_PORT env is not set, default is {}", DEFAULT_TARGET_PORT);
            DEFAULT_TARGET_PORT.to_string()
        });

        let max_db_connections = match lookup("MPS_DB_MAX_OPEN_CONNS") {
            Some(value) => value
                .parse()
                .with_context(|| format!("MPS_DB_MAX_OPEN_CONNS is not a number: {value:?}"))?,
            None => DEFAULT_MAX_DB_CONNECTIONS,
        };

        Ok(Self {
            listen_addr: format!(":{port}"),
            target: format!("{target_host}:{target_port}"),
            connection_string,
            max_db_connections,
        })
    }
}
