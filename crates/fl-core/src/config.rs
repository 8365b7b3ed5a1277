//! Client configuration
//!
//! Command templates and budgets for reaching execution daemons. All
//! fields have working defaults; a config file only needs the keys it
//! overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Helper module for Duration serialization as seconds
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a Duration as seconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize a Duration from seconds (u64)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Configuration for the flowlink client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Secure-shell binary used for port discovery, daemon launch and tunnels
    pub ssh_binary: String,

    /// Daemon binary name, resolved through the remote login shell
    pub daemon_binary: String,

    /// Remote path of the file where a running daemon advertises its port
    pub daemon_port_file: String,

    /// Port-discovery retry budget: how many times the daemon is
    /// (re)launched before giving up
    pub max_port_retries: u32,

    /// First local port probed when binding a tunnel
    pub tunnel_base_port: u16,

    /// Lifetime of the `sleep` keeping a tunnel's ssh process alive
    pub tunnel_keepalive: u64,

    /// TCP connect timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Timeout for one-shot ssh commands (port discovery, launch)
    #[serde(with = "duration_secs")]
    pub subprocess_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            daemon_binary: "flowlinkd".to_string(),
            daemon_port_file: "~/.flowlink/run/flowlinkd.run".to_string(),
            max_port_retries: 3,
            tunnel_base_port: 2125,
            tunnel_keepalive: 300,
            connect_timeout: Duration::from_secs(30),
            subprocess_timeout: Duration::from_secs(30),
        }
    }
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flowlink")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

impl ClientConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from the given path, or from the default location, falling
    /// back to defaults when no file exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => match Self::load(&default_config_path()) {
                Ok(config) => Ok(config),
                Err(ConfigError::NotFound(_)) => Ok(Self::default()),
                Err(e) => Err(e),
            },
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
        }

        std::fs::write(path, content)
            .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

        Ok(())
    }
}
