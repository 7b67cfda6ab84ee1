#![deny(unsafe_code)]

//! Configuration loading and validation for torwatch.
//!
//! Loads TOML configuration files and validates them. Provides the
//! [`AppConfig`] type as the central configuration structure shared by
//! the CLI and the supervisor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon spawning and supervision configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the supervised tor daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// The tor executable to spawn: a bare name resolved via `PATH`
    /// or an absolute path.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Profile directory holding the `tor/` artifact tree. Empty
    /// means the platform default, see
    /// [`resolve_profile_dir`](DaemonConfig::resolve_profile_dir).
    #[serde(default)]
    pub profile_dir: PathBuf,

    /// How long to wait for the daemon to launch before giving up.
    /// Zero disables the watchdog entirely.
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,

    /// Extra torrc options written into the generated configuration
    /// file. Values are escaped on write; keys are torrc option names.
    ///
    /// ```toml
    /// [daemon.torrc]
    /// avoiddiskwrites = "1"
    /// socksport = "auto"
    /// ```
    #[serde(default)]
    pub torrc: BTreeMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            profile_dir: PathBuf::new(),
            launch_timeout_secs: default_launch_timeout_secs(),
            torrc: BTreeMap::new(),
        }
    }
}

impl DaemonConfig {
    /// The configured profile directory, or the platform's local data
    /// directory under `torwatch` when unset.
    pub fn resolve_profile_dir(&self) -> PathBuf {
        if !self.profile_dir.as_os_str().is_empty() {
            return self.profile_dir.clone();
        }
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("torwatch")
    }
}

fn default_binary() -> String {
    "tor".to_string()
}

fn default_launch_timeout_secs() -> u64 {
    90
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using
    /// async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.binary.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.binary must not be empty".to_string(),
            ));
        }
        for key in self.daemon.torrc.keys() {
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::Validation(format!(
                    "daemon.torrc key {key:?} is not a torrc option name"
                )));
            }
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.daemon.binary, "tor");
        assert!(config.daemon.profile_dir.as_os_str().is_empty());
        assert_eq!(config.daemon.launch_timeout_secs, 90);
        assert!(config.daemon.torrc.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.daemon.binary, "tor");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [daemon]
            binary = "/opt/tor/bin/tor"
            profile_dir = "/var/lib/torwatch"
            launch_timeout_secs = 30

            [daemon.torrc]
            avoiddiskwrites = "1"
            socksport = "auto"

            [logging]
            level = "debug"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.daemon.binary, "/opt/tor/bin/tor");
        assert_eq!(config.daemon.profile_dir, PathBuf::from("/var/lib/torwatch"));
        assert_eq!(config.daemon.launch_timeout_secs, 30);
        assert_eq!(
            config.daemon.torrc.get("avoiddiskwrites").map(String::as_str),
            Some("1")
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_empty_binary() {
        let toml = r#"
            [daemon]
            binary = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_log_level() {
        let toml = r#"
            [logging]
            level = "shout"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_torrc_key() {
        let toml = r#"
            [daemon.torrc]
            "socks port" = "9050"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_resolve_profile_dir_prefers_explicit_path() {
        let mut config = AppConfig::default();
        config.daemon.profile_dir = PathBuf::from("/var/lib/torwatch");
        assert_eq!(
            config.daemon.resolve_profile_dir(),
            PathBuf::from("/var/lib/torwatch")
        );
    }

    #[test]
    fn test_resolve_profile_dir_falls_back_to_data_dir() {
        let config = AppConfig::default();
        let resolved = config.daemon.resolve_profile_dir();
        assert!(resolved.ends_with("torwatch"), "got {resolved:?}");
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torwatch.toml");
        tokio::fs::write(&path, "[logging]\nlevel = \"trace\"\n")
            .await
            .unwrap();
        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.logging.level, "trace");
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torwatch.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();
        assert!(matches!(
            AppConfig::load(&path).await,
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            AppConfig::load(&path).await,
            Err(ConfigError::Io(_))
        ));
    }
}
