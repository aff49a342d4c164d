//! Configuration file management.
//!
//! `config.toml` lives in the data directory (`$MURMUR_DATA_DIR` or the
//! platform default). Every section and field is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Protocol settings.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
}

/// Protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Interval between handshake/join-request rebroadcasts while waiting
    /// for a room key, in milliseconds.
    #[serde(default = "default_rebroadcast_interval_ms")]
    pub rebroadcast_interval_ms: u64,
    /// Room joined when none is named.
    #[serde(default = "default_room")]
    pub default_room: String,
    /// Capacity of the event bus.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Capacity of each room's command queue.
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions

fn default_rebroadcast_interval_ms() -> u64 {
    5_000
}

fn default_room() -> String {
    "murmur-global".to_string()
}

fn default_event_buffer() -> usize {
    1000
}

fn default_command_buffer() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            rebroadcast_interval_ms: default_rebroadcast_interval_ms(),
            default_room: default_room(),
            event_buffer: default_event_buffer(),
            command_buffer: default_command_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from the default config file location.
    ///
    /// Falls back to defaults if file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if absent.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }

    /// Path of the SQLite database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("murmur.db")
    }

    /// Rebroadcast interval as a [`Duration`]. Never zero.
    pub fn rebroadcast_interval(&self) -> Duration {
        Duration::from_millis(self.protocol.rebroadcast_interval_ms.max(1))
    }

    /// Get the config file path.
    fn config_path() -> PathBuf {
        Self::default_data_dir().join("config.toml")
    }

    /// Platform-specific default data directory.
    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("MURMUR_DATA_DIR") {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "macos")]
        {
            dirs_fallback("Library/Application Support/Murmur")
        }
        #[cfg(target_os = "windows")]
        {
            dirs_fallback("Murmur")
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            dirs_fallback(".murmur")
        }
    }
}

/// Fallback home directory resolution.
fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from("/tmp/murmur"))
}
