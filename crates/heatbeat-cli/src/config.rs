//! Configuration file management.
//!
//! The file lives at `<config dir>/heatbeat/config.toml` and looks like:
//!
//! ```toml
//! server_url = "http://localhost:8000"
//! token = "..."
//! devices = ["1", "2"]
//!
//! [sync]
//! delivery = "polling"
//! poll_interval_secs = 5
//! ```
//!
//! Command-line flags and `HEATBEAT_URL` / `HEATBEAT_TOKEN` override the file.

use std::path::{Path, PathBuf};

use heatbeat_core::{SyncConfig, ValidationError, format_validation_errors};
use serde::{Deserialize, Serialize};

/// Backend used when neither the file nor the environment names one.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// CLI configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend root URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// Bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Thermostats followed by `watch` and `status` when none are given.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
    /// Engine settings.
    pub sync: SyncConfig,
}

impl Config {
    /// Load from the default location, or defaults if no file exists.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_or_default(default_config_path())
    }

    /// Load from `path`, or defaults if it does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every error found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if let Some(url) = &self.server_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            errors.push(ValidationError::new(
                "server_url",
                format!("'{url}' must start with http:// or https://"),
            ));
        }

        for (i, device) in self.devices.iter().enumerate() {
            if device.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("devices[{i}]"),
                    "device id cannot be empty",
                ));
            } else if self.devices[..i].contains(device) {
                errors.push(ValidationError::new(
                    format!("devices[{i}]"),
                    format!("duplicate device '{device}'"),
                ));
            }
        }

        errors.extend(self.sync.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Backend URL, preferring the command line.
    pub fn resolve_url(&self, arg: Option<String>) -> String {
        arg.or_else(|| self.server_url.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
    }

    /// Token, preferring the command line. Empty tokens count as none.
    pub fn resolve_token(&self, arg: Option<String>) -> Option<String> {
        arg.or_else(|| self.token.clone())
            .filter(|t| !t.trim().is_empty())
    }

    /// Devices named on the command line, or the configured ones.
    pub fn resolve_devices(&self, args: Vec<String>) -> Vec<String> {
        if args.is_empty() {
            self.devices.clone()
        } else {
            args
        }
    }
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("heatbeat")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use heatbeat_core::Delivery;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            server_url: Some("http://hub.local:8000".to_string()),
            token: Some("secret".to_string()),
            devices: vec!["1".to_string(), "4".to_string()],
            sync: SyncConfig::default().push(60),
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.sync.delivery, Delivery::Push);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "devices = [\"3\"]\n\n[sync]\npoll_interval_secs = 10\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.devices, vec!["3"]);
        assert_eq!(config.server_url, None);
        assert_eq!(config.sync.poll_interval_secs, 10);
        assert_eq!(config.sync.keepalive_secs, SyncConfig::default().keepalive_secs);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_error_names_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "devices = 3").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config {
            server_url: Some("hub.local".to_string()),
            devices: vec!["1".to_string(), " ".to_string(), "1".to_string()],
            ..Default::default()
        };
        config.sync.poll_interval_secs = 1;

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["server_url", "devices[1]", "devices[2]", "sync.poll_interval_secs"]
        );
    }

    #[test]
    fn test_resolve_prefers_arguments() {
        let config = Config {
            server_url: Some("http://file:8000".to_string()),
            token: Some("file-token".to_string()),
            devices: vec!["1".to_string()],
            ..Default::default()
        };

        assert_eq!(
            config.resolve_url(Some("http://arg:8000".to_string())),
            "http://arg:8000"
        );
        assert_eq!(config.resolve_url(None), "http://file:8000");
        assert_eq!(config.resolve_token(None).as_deref(), Some("file-token"));
        assert_eq!(config.resolve_devices(vec!["9".to_string()]), vec!["9"]);
        assert_eq!(config.resolve_devices(Vec::new()), vec!["1"]);
    }

    #[test]
    fn test_resolve_defaults() {
        let config = Config::default();
        assert_eq!(config.resolve_url(None), DEFAULT_SERVER_URL);
        assert_eq!(config.resolve_token(Some("  ".to_string())), None);
    }
}
