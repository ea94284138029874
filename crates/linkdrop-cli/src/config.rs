//! Configuration system for the linkdrop CLI.

use linkdrop_core::client::{ClientConfig, DispatchConfig};
use linkdrop_files::StorageConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// linkdrop configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Client configuration
    #[serde(default)]
    pub client: ClientSection,
    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferSection,
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Display name reported to peers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Seconds to wait for a handshake, identity or list reply
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// Data-channel chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Maximum concurrent files per peer
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Seconds a receiving channel may stay silent
    #[serde(default = "default_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Seconds an accepted file may wait for its channel
    #[serde(default = "default_timeout_secs")]
    pub open_timeout_secs: u64,
    /// Negotiation restarts before giving up on a link
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Directory holding received files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Commit page size in bytes
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_response_timeout() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    linkdrop_core::DEFAULT_CHUNK_SIZE
}

fn default_max_concurrent() -> usize {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_restarts() -> u32 {
    2
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("linkdrop")
}

fn default_page_size() -> usize {
    linkdrop_files::DEFAULT_PAGE_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            name: None,
            response_timeout_secs: default_response_timeout(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
            idle_timeout_secs: default_timeout_secs(),
            open_timeout_secs: default_timeout_secs(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            page_size: default_page_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("linkdrop/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Directory of received file entries
    #[must_use]
    pub fn files_dir(&self) -> PathBuf {
        self.storage.data_dir.join("files")
    }

    /// Engine configuration for a client
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            display_name: self.client.name.clone(),
            dispatch: DispatchConfig {
                response_timeout: Duration::from_secs(self.client.response_timeout_secs),
                ..DispatchConfig::default()
            },
            storage: StorageConfig {
                page_size: self.storage.page_size,
            },
            ..ClientConfig::default()
        };
        let transfer = &mut config.transfer;
        transfer.chunk_size = self.transfer.chunk_size;
        transfer.max_concurrent = self.transfer.max_concurrent;
        transfer.idle_timeout = Duration::from_secs(self.transfer.idle_timeout_secs);
        transfer.open_timeout = Duration::from_secs(self.transfer.open_timeout_secs);
        transfer.max_restarts = self.transfer.max_restarts;
        config
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        // Validate chunk size
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > 256 * 1024 {
            anyhow::bail!("Chunk size must be between 1 and 256KB");
        }

        // Validate max concurrent transfers
        if self.transfer.max_concurrent == 0 || self.transfer.max_concurrent > 64 {
            anyhow::bail!("Max concurrent transfers must be between 1 and 64");
        }

        if self.client.response_timeout_secs == 0
            || self.transfer.idle_timeout_secs == 0
            || self.transfer.open_timeout_secs == 0
        {
            anyhow::bail!("Timeouts must be at least one second");
        }

        if let Some(name) = &self.client.name {
            if name.trim().is_empty() {
                anyhow::bail!("Display name must not be empty");
            }
        }

        // Whatever the engine itself rejects
        self.client_config().validate()?;

        Ok(())
    }
}
