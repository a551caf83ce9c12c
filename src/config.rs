//! Client configuration.
//!
//! Configuration layers, later layers overriding earlier ones: built-in
//! defaults, then an optional `tidemark.toml`, then `TIDEMARK_`-prefixed
//! environment variables.

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::DEFAULT_TIMEOUT;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "tidemark.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TIDEMARK_";

/// A configuration loading failure.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(Box<figment::Error>);

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self { Self(Box::new(err)) }
}

/// Connection settings for a [`crate::client::Client`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Maximum time to wait for one request/response exchange, in seconds.
    pub query_timeout_secs: u64,
    /// Maximum time allowed for establishing the TCP connection, in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8553,
            query_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            connect_timeout_secs: 5,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the default file and the environment.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for unreadable files or malformed values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load configuration from a specific TOML file and the environment.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for unreadable files or malformed values.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        Ok(config)
    }

    /// The `host:port` address string.
    #[must_use]
    pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }

    /// The request/response timeout as a [`Duration`].
    #[must_use]
    pub const fn query_timeout(&self) -> Duration { Duration::from_secs(self.query_timeout_secs) }

    /// The connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
