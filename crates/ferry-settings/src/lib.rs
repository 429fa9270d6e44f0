//! Layered TOML configuration for the ferry proxy.
//!
//! Provides structured configuration types for the proxy server,
//! loading from:
//! - Global config: `~/.config/ferry/ferry.toml`
//! - Project config: `<workspace>/.ferry/ferry.toml`
//!
//! Project values take precedence over global values for every field
//! that is explicitly set.
//!
//! # Example
//!
//! ```no_run
//! use ferry_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new("."));
//! println!("{:?}", config.server.listen_addr);
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TOML `[server]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address to listen on (e.g. `"0.0.0.0:1080"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<SocketAddr>,

    /// Maximum concurrent client sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,

    /// TCP connection timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// Relay idle timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// Shutdown grace period in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_secs: Option<u64>,
}

/// TOML `[resolver]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverSettings {
    /// How long resolved hosts stay cached, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

/// TOML `[pool]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum pooled connections, idle plus lent out. 0 = unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// How long a pooled connection may be reused, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lifetime_secs: Option<u64>,
}

/// Top-level ferry configuration, corresponding to `ferry.toml`.
///
/// Every field is optional; unset fields fall back to the built-in
/// defaults when the proxy is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FerryConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerSettings,

    /// Host resolver configuration.
    #[serde(default)]
    pub resolver: ResolverSettings,

    /// Connection pool configuration.
    #[serde(default)]
    pub pool: PoolSettings,
}

impl FerryConfig {
    /// Parse a `FerryConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or a
    /// field has the wrong type for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `FerryConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    ///
    /// Every field is a scalar: `other` wins when explicitly set (`Some`),
    /// otherwise the value from `self` is kept.
    #[must_use]
    pub fn merge(mut self, other: FerryConfig) -> FerryConfig {
        // server: project wins if set
        if other.server.listen_addr.is_some() {
            self.server.listen_addr = other.server.listen_addr;
        }
        if other.server.max_sessions.is_some() {
            self.server.max_sessions = other.server.max_sessions;
        }
        if other.server.connect_timeout_secs.is_some() {
            self.server.connect_timeout_secs = other.server.connect_timeout_secs;
        }
        if other.server.idle_timeout_secs.is_some() {
            self.server.idle_timeout_secs = other.server.idle_timeout_secs;
        }
        if other.server.shutdown_grace_secs.is_some() {
            self.server.shutdown_grace_secs = other.server.shutdown_grace_secs;
        }

        // resolver: project wins if set
        if other.resolver.ttl_secs.is_some() {
            self.resolver.ttl_secs = other.resolver.ttl_secs;
        }

        // pool: project wins if set
        if other.pool.max_connections.is_some() {
            self.pool.max_connections = other.pool.max_connections;
        }
        if other.pool.max_lifetime_secs.is_some() {
            self.pool.max_lifetime_secs = other.pool.max_lifetime_secs;
        }
        self
    }
}
