//! Configuration module
//!
//! Handles loading and saving the ethernet-io configuration.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::TransportConfig;
use crate::protocol::DEFAULT_PORT;
use crate::session::SessionConfig;

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

    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Session timing
    #[serde(default)]
    pub session: SessionSettings,
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this host
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP listen port, also the UDP broadcast port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// How often the serve loop polls for control packets
    #[serde(default = "default_refresh")]
    pub refresh_ms: u64,
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
    #[serde(default = "default_true")]
    pub broadcast_enabled: bool,
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_ms: u64,
    #[serde(default = "default_true")]
    pub watchdog_enabled: bool,
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub handshake_enabled: bool,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

fn default_refresh() -> u64 {
    100
}

fn default_tick() -> u64 {
    10
}

fn default_broadcast_interval() -> u64 {
    1000
}

fn default_watchdog_timeout() -> u64 {
    2000
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_ms: default_refresh(),
            tick_ms: default_tick(),
            broadcast_enabled: default_true(),
            broadcast_interval_ms: default_broadcast_interval(),
            watchdog_enabled: default_true(),
            watchdog_timeout_ms: default_watchdog_timeout(),
            handshake_enabled: default_true(),
            handshake_timeout_ms: default_handshake_timeout(),
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
            dirs::config_dir().map(|p| p.join("ethernet-io/config.toml")),
            Some(PathBuf::from("./ethernet-io.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Transport settings for the given port
    pub fn transport_config(&self, port: u16) -> ConfigResult<TransportConfig> {
        let bind_address: IpAddr = self
            .network
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.network.bind_address.clone()))?;
        Ok(TransportConfig::new(port).with_bind_address(bind_address))
    }

    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            tick_ms: s.tick_ms,
            watchdog_enabled: s.watchdog_enabled,
            watchdog_timeout_ms: s.watchdog_timeout_ms,
            handshake_enabled: s.handshake_enabled,
            handshake_timeout_ms: s.handshake_timeout_ms,
            broadcast_enabled: s.broadcast_enabled,
            broadcast_interval_ms: s.broadcast_interval_ms,
        }
    }
}

/// Sample configuration written by `config --generate`
pub fn generate_sample_config() -> Config {
    Config {
        general: GeneralConfig {
            name: "flight-deck".to_string(),
            verbose: false,
        },
        session: SessionSettings {
            watchdog_timeout_ms: 3000,
            ..Default::default()
        },
        ..Default::default()
    }
}
