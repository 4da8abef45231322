//! Daemon configuration
//!
//! Settings are read from a TOML file. Every section and field is optional;
//! anything missing falls back to the defaults below.
//!
//! ```toml
//! [state]
//! path = "/home/user/.config/deepin_audio_helper.conf"
//!
//! [backend]
//! query_timeout_ms = 5000
//!
//! [service]
//! volume_flag = false
//!
//! [profiles]
//! bluetooth_blacklist = ["a2dp_source"]
//!
//! [logging]
//! filter = "audio_saver=debug"
//! ```

use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{DEFAULT_QUERY_TIMEOUT_MS, STATE_FILE};
use crate::error::ConfigError;
use crate::service::VolumeFlag;

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub state: StateConfig,
    pub backend: BackendConfig,
    pub service: ServiceConfig,
    pub profiles: ProfileConfig,
    pub logging: LoggingConfig,
}

/// Where the snapshot is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        let home = BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: home.join(STATE_FILE),
        }
    }
}

/// Native backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Upper bound on how long a query waits for its terminal reply
    pub query_timeout_ms: u64,
}

impl BackendConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
        }
    }
}

/// Audio service settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Passed verbatim as the secondary argument of every volume-set call.
    /// See [`VolumeFlag`].
    pub volume_flag: VolumeFlag,
}

/// Extra profile names to refuse, on top of the built-in blacklist
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Applied to built-in and unknown cards
    pub builtin_blacklist: Vec<String>,
    pub bluetooth_blacklist: Vec<String>,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Default location of the configuration file
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("com", "deepin", "audio-saver")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Write configuration to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.backend.query_timeout_ms, DEFAULT_QUERY_TIMEOUT_MS);
        assert!(config.state.path.ends_with(STATE_FILE));
        assert_eq!(config.service.volume_flag, VolumeFlag(false));
        assert!(config.profiles.bluetooth_blacklist.is_empty());
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml(
            r#"
            [backend]
            query_timeout_ms = 250

            [service]
            volume_flag = true

            [profiles]
            bluetooth_blacklist = ["a2dp_source"]
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.query_timeout(), Duration::from_millis(250));
        assert_eq!(config.service.volume_flag, VolumeFlag(true));
        assert_eq!(config.profiles.bluetooth_blacklist, vec!["a2dp_source"]);
        assert!(config.profiles.builtin_blacklist.is_empty());
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_invalid_toml() {
        let result = AppConfig::from_toml("[backend]\nquery_timeout_ms = \"soon\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        assert_eq!(AppConfig::load(&path).unwrap(), AppConfig::default());

        let mut config = AppConfig::default();
        config.state.path = dir.path().join("state.bin");
        config.logging.filter = "debug".into();
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }
}
