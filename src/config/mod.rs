//! Configuration module
//!
//! Handles loading and saving swarmcast configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::DEFAULT_GROUP;
use crate::transport::{
    DropPolicy, MediumKind, TransportSettings, DEFAULT_DOMAIN, DEFAULT_QUEUE_LENGTH,
    DEFAULT_WINDOW_SECS,
};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid group address: {0}")]
    InvalidGroup(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Transport settings
    #[serde(default)]
    pub transport: TransportConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Originator identity (host:port if not set)
    pub id: Option<String>,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Multicast group or broadcast address with port
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub kind: MediumKind,
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Largest datagram sent or received
    #[serde(default = "default_queue_length")]
    pub queue_length: usize,
    /// TTL stamped on messages this agent originates
    #[serde(default)]
    pub ttl: u8,
    /// Ceiling on forwarded TTL (0 = never rebroadcast)
    #[serde(default)]
    pub rebroadcast_ttl: u8,
    #[serde(default)]
    pub reduced_header: bool,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Drop messages older than this many seconds
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub drop_rate: f64,
    #[serde(default)]
    pub drop_policy: DropPolicy,
    #[serde(default = "default_bandwidth_window")]
    pub bandwidth_window_secs: u64,
    /// How often `listen` reports and `publish` repeats
    #[serde(default = "default_send_interval")]
    pub send_interval_ms: u64,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_queue_length() -> usize {
    DEFAULT_QUEUE_LENGTH
}

fn default_read_timeout() -> u64 {
    500
}

fn default_bandwidth_window() -> u64 {
    DEFAULT_WINDOW_SECS
}

fn default_send_interval() -> u64 {
    1000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            kind: MediumKind::default(),
            domain: default_domain(),
            queue_length: default_queue_length(),
            ttl: 0,
            rebroadcast_ttl: 0,
            reduced_header: false,
            read_timeout_ms: default_read_timeout(),
            deadline_secs: None,
            drop_rate: 0.0,
            drop_policy: DropPolicy::default(),
            bandwidth_window_secs: default_bandwidth_window(),
            send_interval_ms: default_send_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("swarmcast/config.toml")),
            Some(PathBuf::from("./swarmcast.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Build runtime transport settings.
    ///
    /// Only the group address is checked here; the rest is validated when
    /// the transport starts.
    pub fn transport_settings(&self) -> ConfigResult<TransportSettings> {
        let t = &self.transport;
        let group: SocketAddr = t
            .group
            .parse()
            .map_err(|_| ConfigError::InvalidGroup(t.group.clone()))?;

        Ok(TransportSettings {
            group,
            kind: t.kind,
            id: self.general.id.clone(),
            domain: t.domain.clone(),
            queue_length: t.queue_length,
            ttl: t.ttl,
            rebroadcast_ttl: t.rebroadcast_ttl,
            reduced_header: t.reduced_header,
            read_timeout: Duration::from_millis(t.read_timeout_ms),
            deadline: t.deadline_secs.map(Duration::from_secs),
            drop_rate: t.drop_rate,
            drop_policy: t.drop_policy,
            bandwidth_window_secs: t.bandwidth_window_secs,
            ..Default::default()
        })
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.transport.send_interval_ms.max(1))
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            id: Some("scout-1".to_string()),
            verbose: false,
        },
        transport: TransportConfig {
            domain: "search-team".to_string(),
            ttl: 2,
            rebroadcast_ttl: 2,
            deadline_secs: Some(30),
            ..Default::default()
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}
