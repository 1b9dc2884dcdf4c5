//! Configuration management for ClipMesh
//!
//! This module handles loading, validating, and managing configuration
//! for the ClipMesh daemon.

use crate::storage::SecretBackend;
use crate::sync::{ClientTimeouts, SyncSettings};
use crate::tasks::chunk::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY};
use crate::tasks::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV: &str = "CLIPMESH_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("Failed to write TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Fixed instance id; generated and stored in the database when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Name shown to other devices
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Port of the peer API; 0 picks a free port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Directory holding the database and key file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub tasks: TasksConfig,

    #[serde(default)]
    pub secret: SecretConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Peer connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between resolve cycles while connected
    #[serde(default = "default_base_refresh_secs")]
    pub base_refresh_secs: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Files other devices may pull from us
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,

    /// Icons other devices may pull from us, and where pulled icons land
    #[serde(default = "default_icon_dir")]
    pub icon_dir: PathBuf,
}

/// Background task settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Attempts before a retryable failure becomes final
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Bytes per pulled chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Concurrent chunk requests per pull
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Where pulled files are written
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

/// Master key storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SecretConfig {
    #[serde(default)]
    pub backend: SecretBackend,
}

/// mDNS settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Announce and browse on the local network
    #[serde(default = "default_discovery_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_device_name() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

fn default_listen_port() -> u16 {
    8486
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.local/share/clipmesh")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_refresh_secs() -> u64 {
    60
}

fn default_probe_timeout_ms() -> u64 {
    800
}

fn default_heartbeat_timeout_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_shared_dir() -> PathBuf {
    PathBuf::from("~/.local/share/clipmesh/shared")
}

fn default_icon_dir() -> PathBuf {
    PathBuf::from("~/.local/share/clipmesh/icons")
}

fn default_max_attempts() -> usize {
    3
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("~/Downloads/clipmesh")
}

fn default_discovery_enabled() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_refresh_secs: default_base_refresh_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            shared_dir: default_shared_dir(),
            icon_dir: default_icon_dir(),
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            download_dir: default_download_dir(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_discovery_enabled(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: None,
            device_name: default_device_name(),
            listen_port: default_listen_port(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            sync: SyncConfig::default(),
            tasks: TasksConfig::default(),
            secret: SecretConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Checks in order:
    /// 1. Path from CLIPMESH_CONFIG environment variable
    /// 2. ~/.config/clipmesh/config.toml
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => {
                let mut config = Self::default();
                config.expand_paths();
                Ok(config)
            }
        }
    }

    /// Load from an explicit path, or from the default locations
    pub fn load_config(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(toml_str)?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("clipmesh").join("config.toml"))
    }

    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        Self::default_path().filter(|p| p.exists())
    }

    fn expand_paths(&mut self) {
        self.data_dir = expand_path(&self.data_dir);
        self.sync.shared_dir = expand_path(&self.sync.shared_dir);
        self.sync.icon_dir = expand_path(&self.sync.icon_dir);
        self.tasks.download_dir = expand_path(&self.tasks.download_dir);
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.instance_id {
            if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c == ',') {
                return Err(ConfigError::Validation(
                    "instance_id must be non-empty without whitespace or commas".to_string(),
                ));
            }
        }

        if self.device_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "device_name must not be empty".to_string(),
            ));
        }

        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::Validation(format!(
                "log_level must be one of trace, debug, info, warn, error (got '{}')",
                self.log_level
            )));
        }

        if self.sync.base_refresh_secs < 5 {
            return Err(ConfigError::Validation(
                "base_refresh_secs must be at least 5".to_string(),
            ));
        }
        if self.sync.probe_timeout_ms == 0
            || self.sync.heartbeat_timeout_ms == 0
            || self.sync.request_timeout_secs == 0
        {
            return Err(ConfigError::Validation(
                "timeouts must be positive".to_string(),
            ));
        }

        // Range matches what peers accept for a single chunk request
        if self.tasks.chunk_size < 64 * 1024 || self.tasks.chunk_size > 64 * 1024 * 1024 {
            return Err(ConfigError::Validation(
                "chunk_size must be between 65536 bytes (64KB) and 67108864 bytes (64MB)"
                    .to_string(),
            ));
        }
        if !(1..=16).contains(&self.tasks.concurrency) {
            return Err(ConfigError::Validation(
                "concurrency must be between 1 and 16".to_string(),
            ));
        }
        if !(1..=10).contains(&self.tasks.max_attempts) {
            return Err(ConfigError::Validation(
                "max_attempts must be between 1 and 10".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate configuration file at given path
    pub fn validate_file(path: &Path) -> Result<Self, ConfigError> {
        Self::load_from_path(path)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not find config directory",
            ))
        })?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Write the commented example file, refusing to overwrite unless forced
    pub fn generate_example_config(path: &Path, force: bool) -> Result<(), ConfigError> {
        if !force && path.exists() {
            return Err(ConfigError::Validation(
                "Config file already exists. Use --force to overwrite.".to_string(),
            ));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::generate_example())?;
        Ok(())
    }

    /// Generate example configuration file
    pub fn generate_example() -> String {
        let config = Config::default();

        format!(
            r#"# ClipMesh Configuration File
# Location: ~/.config/clipmesh/config.toml

# Fixed instance id (generated on first start when unset)
# instance_id = "my-laptop"

# Name shown to other devices
device_name = "{}"
# Port of the peer API (0 picks a free port)
listen_port = {}
# Database and key file location
data_dir = "{}"
# Logging level (trace, debug, info, warn, error)
log_level = "{}"

# Peer connection settings
[sync]
# Seconds between checks of a connected device
base_refresh_secs = {}
probe_timeout_ms = {}
heartbeat_timeout_ms = {}
request_timeout_secs = {}
# Files other devices may pull
shared_dir = "{}"
# Icons served to and pulled from other devices
icon_dir = "{}"

# Background pulls
[tasks]
# Attempts before a failed pull is given up
max_attempts = {}
# Bytes per chunk (4MB default)
chunk_size = {}
# Chunks fetched in parallel
concurrency = {}
download_dir = "{}"

# Master key storage: auto, keyring, file or memory
[secret]
backend = "auto"

# Local network discovery
[discovery]
enabled = {}
"#,
            config.device_name.replace('"', "'"),
            config.listen_port,
            config.data_dir.display(),
            config.log_level,
            config.sync.base_refresh_secs,
            config.sync.probe_timeout_ms,
            config.sync.heartbeat_timeout_ms,
            config.sync.request_timeout_secs,
            config.sync.shared_dir.display(),
            config.sync.icon_dir.display(),
            config.tasks.max_attempts,
            config.tasks.chunk_size,
            config.tasks.concurrency,
            config.tasks.download_dir.display(),
            config.discovery.enabled,
        )
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("clipmesh.db")
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            base_refresh: Duration::from_secs(self.sync.base_refresh_secs),
        }
    }

    pub fn client_timeouts(&self) -> ClientTimeouts {
        ClientTimeouts {
            probe: Duration::from_millis(self.sync.probe_timeout_ms),
            heartbeat: Duration::from_millis(self.sync.heartbeat_timeout_ms),
            request: Duration::from_secs(self.sync.request_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.tasks.max_attempts)
    }
}

/// Expand tilde in path
fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(path_str.as_ref());
    PathBuf::from(expanded.into_owned())
}
