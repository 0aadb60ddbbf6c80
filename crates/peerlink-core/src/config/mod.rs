//! Configuration management for PeerLink.
//!
//! This module handles loading, saving, and validating PeerLink configuration.
//! Every timeout, retry and keep-alive constant used by the supervisor, the
//! transfer client/server and the sync coordinator lives here.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/peerlink/config.toml` |
//! | macOS | `~/Library/Application Support/PeerLink/config.toml` |
//! | Windows | `%APPDATA%\PeerLink\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use peerlink_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Transfer port: {}", config.transfer.port);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for PeerLink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection supervisor settings
    pub connection: ConnectionConfig,
    /// Transfer client and server settings
    pub transfer: TransferConfig,
    /// Folder sync settings
    pub sync: SyncConfig,
    /// Transfer history settings
    pub history: HistoryConfig,
}

/// Connection supervisor policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Deadline for a connect request to reach Connected
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Repeated connect requests inside this window are ignored
    #[serde(with = "humantime_serde")]
    pub min_action_interval: Duration,
    /// Period of the keep-alive check while connected
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    /// Lower bound between two keep-alive checks
    #[serde(with = "humantime_serde")]
    pub min_keep_alive_check_interval: Duration,
    /// Consecutive keep-alive failures that end the connection
    pub keep_alive_failure_threshold: u32,
    /// Retries allowed for transient transport failures
    pub max_connect_retries: u32,
    /// Base delay between retries, multiplied by the attempt number
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    /// Upper bound for each teardown step of a disconnect
    #[serde(with = "humantime_serde")]
    pub teardown_step_timeout: Duration,
    /// Delay before discovery is restarted after a disconnect
    #[serde(with = "humantime_serde")]
    pub discovery_restart_delay: Duration,
    /// Reconnect to the same peer after a keep-alive loss
    pub auto_reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            min_action_interval: Duration::from_secs(1),
            keep_alive_interval: Duration::from_secs(5),
            min_keep_alive_check_interval: Duration::from_secs(2),
            keep_alive_failure_threshold: 3,
            max_connect_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            teardown_step_timeout: Duration::from_secs(5),
            discovery_restart_delay: Duration::from_secs(1),
            auto_reconnect: false,
        }
    }
}

/// Transfer client and server policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// TCP port of the transfer server
    pub port: u16,
    /// Deadline for one TCP connect attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Deadline for every line read and every chunk read or write
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// TCP connect attempts per operation
    pub max_connect_attempts: u32,
    /// Base delay between connect attempts, multiplied by the attempt number
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Chunk size for streaming file bytes
    pub chunk_size: usize,
    /// Attempts to bind the listening socket
    pub bind_attempts: u32,
    /// Delay between bind attempts
    #[serde(with = "humantime_serde")]
    pub bind_retry_delay: Duration,
    /// Longest accepted command or reply line in bytes
    pub max_line_length: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_TRANSFER_PORT,
            connect_timeout: Duration::from_secs(15),
            response_timeout: Duration::from_secs(30),
            max_connect_attempts: 3,
            retry_delay: Duration::from_secs(2),
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            bind_attempts: 3,
            bind_retry_delay: Duration::from_secs(1),
            max_line_length: 16 * 1024 * 1024,
        }
    }
}

/// Folder sync policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Transfers run concurrently during one sync (1 = sequential)
    pub parallel_transfers: usize,
    /// Include files in subdirectories of the local folder
    pub recursive: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parallel_transfers: 1,
            recursive: true,
        }
    }
}

/// Transfer history settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum entries kept in memory
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_entries: 1000 }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read,
    /// parsed, or validated.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, reason: &str) -> Error {
            Error::InvalidConfig {
                key: key.to_string(),
                reason: reason.to_string(),
            }
        }

        let conn = &self.connection;
        if conn.connect_timeout.is_zero() {
            return Err(invalid("connection.connect_timeout", "must be positive"));
        }
        if conn.keep_alive_interval.is_zero() {
            return Err(invalid("connection.keep_alive_interval", "must be positive"));
        }
        if conn.keep_alive_failure_threshold == 0 {
            return Err(invalid(
                "connection.keep_alive_failure_threshold",
                "must be at least 1",
            ));
        }

        let transfer = &self.transfer;
        if transfer.port == 0 {
            return Err(invalid("transfer.port", "must not be 0"));
        }
        if transfer.chunk_size == 0 {
            return Err(invalid("transfer.chunk_size", "must be positive"));
        }
        if transfer.max_connect_attempts == 0 {
            return Err(invalid("transfer.max_connect_attempts", "must be at least 1"));
        }
        if transfer.bind_attempts == 0 {
            return Err(invalid("transfer.bind_attempts", "must be at least 1"));
        }
        if transfer.connect_timeout.is_zero() || transfer.response_timeout.is_zero() {
            return Err(invalid("transfer", "timeouts must be positive"));
        }
        if transfer.max_line_length < 64 {
            return Err(invalid("transfer.max_line_length", "must be at least 64"));
        }

        if self.sync.parallel_transfers == 0 {
            return Err(invalid("sync.parallel_transfers", "must be at least 1"));
        }

        Ok(())
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "peerlink", "PeerLink")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();
        // "ms" must be tried before "s"
        s.strip_suffix("ms")
            .map(|millis| {
                millis
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('s').map(|secs| {
                    secs.parse()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                })
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}
