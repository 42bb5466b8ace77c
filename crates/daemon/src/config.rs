//! Daemon configuration, loaded from TOML
//!
//! ```toml
//! log_dir = "/var/log/rawfs"
//!
//! [dispatcher]
//! entry_timeout_secs = 1.0
//! attr_timeout_secs = 1.0
//! max_background = 16
//! ```
//!
//! Every field has a default, so an empty file (or no file) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the config file inside the config directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dispatcher: DispatcherConfig,
    /// Directory for rolling log files; stderr only when unset
    pub log_dir: Option<PathBuf>,
}

/// Parameters of the request dispatcher and the init handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How long the kernel may cache a name lookup
    pub entry_timeout_secs: f64,
    /// How long the kernel may cache attributes
    pub attr_timeout_secs: f64,
    pub max_readahead: u32,
    pub max_write: u32,
    /// Requests processed concurrently
    pub max_background: u16,
    pub congestion_threshold: u16,
    /// Owner reported on every attribute; the backend's value when unset
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            entry_timeout_secs: 1.0,
            attr_timeout_secs: 1.0,
            max_readahead: 128 * 1024,
            max_write: 128 * 1024,
            max_background: 16,
            congestion_threshold: 12,
            uid: None,
            gid: None,
        }
    }
}

impl DispatcherConfig {
    /// Zero when the configured value is not a representable duration
    pub fn entry_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.entry_timeout_secs).unwrap_or_default()
    }

    pub fn attr_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.attr_timeout_secs).unwrap_or_default()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("entry_timeout_secs", self.entry_timeout_secs),
            ("attr_timeout_secs", self.attr_timeout_secs),
        ] {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative number of seconds, got {value}"
                )));
            }
        }
        if self.max_background == 0 {
            return Err(ConfigError::Invalid(
                "max_background must be at least 1".to_string(),
            ));
        }
        if self.max_write < 4096 {
            return Err(ConfigError::Invalid(
                "max_write must be at least 4096".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Parse and validate a config from TOML text
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.dispatcher.validate()?;
        Ok(config)
    }

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    /// Load from an explicit path, else from the default location if a file
    /// exists there, else fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/rawfs/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rawfs").join(CONFIG_FILE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("", Path::new("config.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.dispatcher.entry_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_config() {
        let text = r#"
            log_dir = "/tmp/rawfs-logs"

            [dispatcher]
            attr_timeout_secs = 0.5
            max_background = 4
            uid = 1000
        "#;
        let config = Config::from_toml(text, Path::new("config.toml")).unwrap();
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/rawfs-logs")));
        assert_eq!(config.dispatcher.attr_timeout(), Duration::from_millis(500));
        assert_eq!(config.dispatcher.max_background, 4);
        assert_eq!(config.dispatcher.uid, Some(1000));
        assert_eq!(config.dispatcher.gid, None);
        assert_eq!(config.dispatcher.max_write, 128 * 1024);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let text = "[dispatcher]\nmax_background = 0\n";
        assert!(matches!(
            Config::from_toml(text, Path::new("config.toml")),
            Err(ConfigError::Invalid(_))
        ));

        for value in ["-1.0", "1e20", "nan", "inf"] {
            let text = format!("[dispatcher]\nentry_timeout_secs = {value}\n");
            assert!(
                matches!(
                    Config::from_toml(&text, Path::new("config.toml")),
                    Err(ConfigError::Invalid(_))
                ),
                "entry_timeout_secs = {value}"
            );
        }

        let text = "[dispatcher]\nattr_timeout_secs = 1e20\n";
        assert!(matches!(
            Config::from_toml(text, Path::new("config.toml")),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unvalidated_timeouts_do_not_panic() {
        let config = DispatcherConfig {
            entry_timeout_secs: 1e20,
            attr_timeout_secs: f64::NAN,
            ..DispatcherConfig::default()
        };
        assert_eq!(config.entry_timeout(), Duration::ZERO);
        assert_eq!(config.attr_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_parse_error_names_the_file() {
        let err = Config::from_toml("dispatcher = 3", Path::new("/etc/rawfs.toml")).unwrap_err();
        assert!(err.to_string().contains("/etc/rawfs.toml"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[dispatcher]\nmax_write = 65536\n").unwrap();

        let config = Config::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.dispatcher.max_write, 65536);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::load(&missing),
            Err(ConfigError::Read { .. })
        ));
    }
}
