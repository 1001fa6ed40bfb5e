//! Daemon configuration.
//!
//! Settings live in `<config_dir>/crew/config.toml`. Every key is optional:
//!
//! ```toml
//! socket_path = "/tmp/crew.sock"
//! binary_path = "/opt/agent/bin/claude"   # persisted override
//! binary_name = "claude"
//! cache_capacity = 10000
//! retention_secs = 1800
//! cancel_grace_ms = 3000
//! cleanup_interval_secs = 5
//! default_model = "sonnet"
//! ```
//!
//! Environment overrides: `CREW_CONFIG` (file location), `CREW_SOCKET`,
//! `CREW_AGENT_BINARY`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::registry::RegistryConfig;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/crew.sock";

/// Agent executable looked up when no override is set
pub const DEFAULT_BINARY_NAME: &str = "claude";

pub const ENV_CONFIG: &str = "CREW_CONFIG";
pub const ENV_SOCKET: &str = "CREW_SOCKET";
pub const ENV_AGENT_BINARY: &str = "CREW_AGENT_BINARY";

/// Persistent daemon settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,

    /// Agent binary chosen by the user; wins over discovery when it exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,

    pub binary_name: String,

    /// Events kept per session before the oldest are evicted.
    pub cache_capacity: usize,

    /// How long a terminal session stays listed once nobody watches it.
    pub retention_secs: u64,

    pub cancel_grace_ms: u64,

    pub cleanup_interval_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// `CREW_AGENT_BINARY`; never written back to disk.
    #[serde(skip)]
    pub env_binary: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            binary_path: None,
            binary_name: DEFAULT_BINARY_NAME.to_string(),
            cache_capacity: crew_core::DEFAULT_CACHE_CAPACITY,
            retention_secs: 1800,
            cancel_grace_ms: 3000,
            cleanup_interval_secs: 5,
            default_model: None,
            env_binary: None,
        }
    }
}

impl DaemonConfig {
    /// Config file location: `CREW_CONFIG`, else `<config_dir>/crew/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os(ENV_CONFIG) {
            return Ok(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join("crew").join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Loads the default file and applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::default_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Reads a config file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `CREW_SOCKET` and `CREW_AGENT_BINARY` from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(socket) = lookup(ENV_SOCKET).filter(|s| !s.trim().is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
        self.env_binary = lookup(ENV_AGENT_BINARY)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
    }

    /// Writes the file, creating its directory if needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Sets (or clears with `None`) the persisted binary override in `path`.
    ///
    /// Blank paths clear the override. A non-blank path must be a file.
    pub fn set_binary_override(path: &Path, binary: Option<PathBuf>) -> Result<Self, ConfigError> {
        let binary = binary.filter(|p| !p.as_os_str().to_string_lossy().trim().is_empty());
        if let Some(binary) = &binary {
            if !binary.is_file() {
                return Err(ConfigError::BinaryNotFile(binary.clone()));
            }
        }
        let mut config = Self::load_from(path)?;
        config.binary_path = binary;
        config.save_to(path)?;
        Ok(config)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Registry tuning derived from this config.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            cache_capacity: self.cache_capacity,
            retention: Duration::from_secs(self.retention_secs),
            cancel_grace: self.cancel_grace(),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs.max(1)),
            ..RegistryConfig::default()
        }
    }
}

/// Errors that can occur while reading or writing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine the user config directory")]
    NoConfigDir,

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Agent binary override is not a file: {0}")]
    BinaryNotFile(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = DaemonConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.cache_capacity, 10_000);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "cache_capacity = 50\ncancel_grace_ms = 200\n").unwrap();

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.cache_capacity, 50);
        assert_eq!(config.cancel_grace(), Duration::from_millis(200));
        assert_eq!(config.binary_name, DEFAULT_BINARY_NAME);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "cache_capacity = \"lots\"").unwrap();
        assert!(matches!(
            DaemonConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_SOCKET, "/run/crew.sock"),
            (ENV_AGENT_BINARY, "/opt/claude"),
        ]
        .into_iter()
        .collect();

        let mut config = DaemonConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.socket_path, PathBuf::from("/run/crew.sock"));
        assert_eq!(config.env_binary, Some(PathBuf::from("/opt/claude")));
    }

    #[test]
    fn test_set_and_clear_binary_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let binary = dir.path().join("claude");
        fs::write(&binary, "#!/bin/sh\n").unwrap();

        let saved = DaemonConfig::set_binary_override(&path, Some(binary.clone())).unwrap();
        assert_eq!(saved.binary_path, Some(binary.clone()));
        assert_eq!(DaemonConfig::load_from(&path).unwrap().binary_path, Some(binary));

        let cleared = DaemonConfig::set_binary_override(&path, Some(PathBuf::from("  "))).unwrap();
        assert_eq!(cleared.binary_path, None);
        assert_eq!(DaemonConfig::load_from(&path).unwrap().binary_path, None);
    }

    #[test]
    fn test_override_must_be_a_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let err = DaemonConfig::set_binary_override(&path, Some(dir.path().to_path_buf()));
        assert!(matches!(err, Err(ConfigError::BinaryNotFile(_))));
    }

    #[test]
    fn test_env_binary_is_not_persisted() {
        let mut config = DaemonConfig::default();
        config.env_binary = Some(PathBuf::from("/x"));
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(!text.contains("env_binary"));
    }
}
