//! Daemon Configuration
//!
//! Static settings of the daemon process itself, read once at startup from a
//! TOML file. User facing VPN settings live in [`fos_vpn::Settings`] and are
//! changed at runtime through the management socket.
//!
//! ```toml
//! socket_path = "/run/fos-vpnd/fos-vpnd.sock"
//! settings_dir = "/var/lib/fos-vpnd"
//! relay_list_path = "/var/lib/fos-vpnd/relays.json"
//! relay_list_refresh_secs = 3600
//! attempt_timeout_secs = 15
//! max_connect_attempts = 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "FOS_VPND_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Management socket
    pub socket_path: PathBuf,
    /// Directory holding `settings.json` and `device.json`
    pub settings_dir: PathBuf,
    /// Relay list JSON, reloaded when it changes
    pub relay_list_path: PathBuf,
    pub relay_list_refresh_secs: u64,
    /// Time allowed for one connection attempt
    pub attempt_timeout_secs: u64,
    /// Attempts before giving up and entering the error state
    pub max_connect_attempts: u32,
    /// Events buffered per subscriber before it is disconnected
    pub subscriber_buffer: usize,
    /// Largest accepted management frame (bytes)
    pub max_frame_size: usize,
    /// Queued commands for the control loop
    pub command_buffer: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/fos-vpnd/fos-vpnd.sock"),
            settings_dir: PathBuf::from("/var/lib/fos-vpnd"),
            relay_list_path: PathBuf::from("/var/lib/fos-vpnd/relays.json"),
            relay_list_refresh_secs: 3600,
            attempt_timeout_secs: 15,
            max_connect_attempts: 4,
            subscriber_buffer: 256,
            max_frame_size: fos_ipc::codec::DEFAULT_MAX_FRAME_SIZE,
            command_buffer: 64,
        }
    }
}

impl DaemonConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(e.to_string())),
        }
    }

    /// Load from the first argument or [`CONFIG_ENV`], else defaults
    pub fn load(arg: Option<PathBuf>) -> Result<Self, ConfigError> {
        match arg.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from)) {
            Some(path) => Self::from_toml_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingPath("socket_path"));
        }
        if self.settings_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingPath("settings_dir"));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("attempt_timeout_secs"));
        }
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::ZeroValue("max_connect_attempts"));
        }
        if self.relay_list_refresh_secs == 0 {
            return Err(ConfigError::ZeroValue("relay_list_refresh_secs"));
        }
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::ZeroValue("subscriber_buffer"));
        }
        if self.command_buffer == 0 {
            return Err(ConfigError::ZeroValue("command_buffer"));
        }
        if self.max_frame_size < 1024 {
            return Err(ConfigError::FrameSizeTooLow);
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn relay_list_refresh(&self) -> Duration {
        Duration::from_secs(self.relay_list_refresh_secs)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("{0} must not be empty")]
    MissingPath(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("max_frame_size too low (minimum 1KB)")]
    FrameSizeTooLow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_connect_attempts, 4);
        assert_eq!(config.attempt_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DaemonConfig::from_toml(
            r#"
            socket_path = "/tmp/vpnd.sock"
            max_connect_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/tmp/vpnd.sock"));
        assert_eq!(config.max_connect_attempts, 2);
        assert_eq!(config.subscriber_buffer, DaemonConfig::default().subscriber_buffer);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert_eq!(
            DaemonConfig::from_toml("attempt_timeout_secs = 0"),
            Err(ConfigError::ZeroValue("attempt_timeout_secs"))
        );
        assert_eq!(
            DaemonConfig::from_toml("max_frame_size = 10"),
            Err(ConfigError::FrameSizeTooLow)
        );
        assert!(matches!(
            DaemonConfig::from_toml("max_connect_attempts = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::from_toml_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = DaemonConfig::default();
        let toml = config.to_toml().unwrap();
        assert_eq!(DaemonConfig::from_toml(&toml).unwrap(), config);
    }
}
