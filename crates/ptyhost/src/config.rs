//! Configuration management for ptyhost.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptyhost/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::output::DEFAULT_MAX_OUTPUT_BYTES;
use crate::session::pty::PtyDefaults;
use crate::session::screen::DEFAULT_SCROLLBACK_LINES;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("max_ptys_per_session must be between 1 and 1000, got {0}")]
    InvalidMaxPtys(usize),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    #[error("kill_grace_ms must be between 0 and 60000, got {0}")]
    InvalidKillGrace(u64),

    #[error("max_output_bytes must be greater than 0, got {0}")]
    InvalidMaxOutput(usize),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,

    /// Defaults applied to every spawned PTY.
    pub pty: PtyConfig,

    /// Session limits.
    pub sessions: SessionsConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Write logs to this file (rotated daily) instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// PTY defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PtyConfig {
    /// Shell used for shell-mode PTYs.
    pub default_shell: String,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Milliseconds between SIGTERM and SIGKILL when killing a PTY.
    pub kill_grace_ms: u64,

    /// Seconds without input or output before a PTY reports idle (0 = never).
    pub idle_timeout_secs: u64,

    /// Lines kept above the visible screen for the plain-text view.
    pub scrollback_lines: usize,

    /// Raw output bytes retained per PTY.
    pub max_output_bytes: usize,
}

/// Session limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionsConfig {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Maximum number of PTYs within one session.
    pub max_ptys_per_session: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            cols: 80,
            rows: 24,
            kill_grace_ms: 3000,
            idle_timeout_secs: 0,
            scrollback_lines: DEFAULT_SCROLLBACK_LINES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            max_ptys_per_session: 64,
        }
    }
}

impl From<&PtyConfig> for PtyDefaults {
    fn from(config: &PtyConfig) -> Self {
        Self {
            shell: config.default_shell.clone(),
            cols: config.cols,
            rows: config.rows,
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
            scrollback_lines: config.scrollback_lines,
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyhost")
        .join("config.toml")
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYHOST_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYHOST_SHELL: Override the shell used in shell mode
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PTYHOST_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.log.level = level;
            }
        }

        if let Ok(shell) = std::env::var("PTYHOST_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding default_shell from environment: {}", shell);
                self.pty.default_shell = shell;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sessions = &self.sessions;
        if !(1..=1000).contains(&sessions.max_sessions) {
            return Err(ConfigError::InvalidMaxSessions(sessions.max_sessions));
        }
        if !(1..=1000).contains(&sessions.max_ptys_per_session) {
            return Err(ConfigError::InvalidMaxPtys(sessions.max_ptys_per_session));
        }

        let pty = &self.pty;
        if pty.cols == 0 || pty.rows == 0 {
            return Err(ConfigError::InvalidSize {
                cols: pty.cols,
                rows: pty.rows,
            });
        }
        if pty.kill_grace_ms > 60_000 {
            return Err(ConfigError::InvalidKillGrace(pty.kill_grace_ms));
        }
        if pty.max_output_bytes == 0 {
            return Err(ConfigError::InvalidMaxOutput(pty.max_output_bytes));
        }

        // Absolute paths must exist; bare names must be on PATH.
        let shell_path = Path::new(&pty.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&pty.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(pty.default_shell.clone()));
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.pty.default_shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.log.level, "info");
        assert!(config.log.file.is_none());
        assert_eq!(config.pty.cols, 80);
        assert_eq!(config.pty.rows, 24);
        assert_eq!(config.pty.kill_grace_ms, 3000);
        assert_eq!(config.pty.idle_timeout_secs, 0);
        assert_eq!(config.pty.max_output_bytes, 8 * 1024 * 1024);
        assert_eq!(config.sessions.max_sessions, 64);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
            [pty]
            cols = 132
            kill_grace_ms = 500
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.pty.cols, 132);
        assert_eq!(config.pty.kill_grace_ms, 500);
        // Unspecified values keep their defaults
        assert_eq!(config.pty.rows, 24);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
            [log]
            level = "debug"
            file = "/var/log/ptyhost/ptyhost.log"

            [pty]
            default_shell = "/bin/bash"
            cols = 100
            rows = 30
            kill_grace_ms = 1000
            idle_timeout_secs = 60
            scrollback_lines = 500
            max_output_bytes = 65536

            [sessions]
            max_sessions = 4
            max_ptys_per_session = 8
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(
            config.log.file,
            Some(PathBuf::from("/var/log/ptyhost/ptyhost.log"))
        );
        assert_eq!(config.pty.default_shell, "/bin/bash");
        assert_eq!(config.pty.idle_timeout_secs, 60);
        assert_eq!(config.pty.scrollback_lines, 500);
        assert_eq!(config.pty.max_output_bytes, 65536);
        assert_eq!(config.sessions.max_sessions, 4);
        assert_eq!(config.sessions.max_ptys_per_session, 8);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[pty\ncols = 80");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[pty]\ncols = \"wide\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
            [pty]
            cols = 90
            colour = "green"

            [telemetry]
            enabled = true
        "#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.pty.cols, 90);
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = Config::default();
        config.log.level = "warn".to_string();
        config.log.file = Some(PathBuf::from("/tmp/ptyhost.log"));
        config.pty.idle_timeout_secs = 30;
        config.sessions.max_ptys_per_session = 2;

        let toml = config.to_toml().unwrap();
        assert_eq!(Config::from_toml(&toml).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/ptyhost/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("config.toml");

        let mut config = Config::default();
        config.pty.rows = 50;
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("ptyhost/config.toml"));
    }

    #[test]
    fn test_pty_defaults_conversion() {
        let mut config = PtyConfig::default();
        config.kill_grace_ms = 250;
        config.idle_timeout_secs = 0;

        let defaults = PtyDefaults::from(&config);
        assert_eq!(defaults.kill_grace, Duration::from_millis(250));
        assert_eq!(defaults.idle_timeout, None);
        assert_eq!(defaults.cols, 80);

        config.idle_timeout_secs = 10;
        let defaults = PtyDefaults::from(&config);
        assert_eq!(defaults.idle_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("PTYHOST_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.log.level, "trace");

        std::env::remove_var("PTYHOST_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_shell() {
        std::env::set_var("PTYHOST_SHELL", "/bin/dash");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.pty.default_shell, "/bin/dash");

        std::env::remove_var("PTYHOST_SHELL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("PTYHOST_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.log.level, "info");

        std::env::remove_var("PTYHOST_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        std::env::remove_var("PTYHOST_LOG_LEVEL");
        std::env::remove_var("PTYHOST_SHELL");

        let mut config = valid_config();
        config.apply_env_overrides();
        assert_eq!(config, valid_config());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions() {
        let mut config = valid_config();
        config.sessions.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.sessions.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.sessions.max_sessions = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_ptys() {
        let mut config = valid_config();
        config.sessions.max_ptys_per_session = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxPtys(0)));
    }

    #[test]
    fn test_validate_zero_size() {
        let mut config = valid_config();
        config.pty.rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidSize { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_validate_kill_grace() {
        let mut config = valid_config();
        config.pty.kill_grace_ms = 0;
        assert!(config.validate().is_ok());

        config.pty.kill_grace_ms = 60_001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidKillGrace(60_001)));
    }

    #[test]
    fn test_validate_max_output_zero() {
        let mut config = valid_config();
        config.pty.max_output_bytes = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxOutput(0)));
    }

    #[test]
    fn test_validate_shell_path_absolute_not_exists() {
        let mut config = valid_config();
        config.pty.default_shell = "/nonexistent/path/to/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "/nonexistent/path/to/shell".to_string()
            ))
        );
    }

    #[test]
    fn test_validate_shell_path_in_path() {
        let mut config = valid_config();
        config.pty.default_shell = "sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_shell_path_not_in_path() {
        let mut config = valid_config();
        config.pty.default_shell = "nonexistent_shell_xyz".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "nonexistent_shell_xyz".to_string()
            ))
        );
    }

    #[test]
    fn test_validate_log_level_case_insensitive() {
        let mut config = valid_config();
        for level in ["TRACE", "Debug", "info", "WARN", "error"] {
            config.log.level = level.to_string();
            assert!(config.validate().is_ok(), "{level} should be accepted");
        }
    }

    #[test]
    fn test_validate_log_level_invalid() {
        let mut config = valid_config();
        config.log.level = "warning".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("warning".to_string()))
        );
    }
}
