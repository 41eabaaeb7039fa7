//! Configuration management for VivyTerm.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/vivyterm/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("terminal_cache_capacity must be at least 1, got {0}")]
    InvalidCacheCapacity(usize),

    #[error("max_attempts must be between 1 and 10, got {0}")]
    InvalidMaxAttempts(u32),

    #[error("default terminal size must be non-zero, got {0}x{1}")]
    InvalidTerminalSize(u16, u16),

    #[error("term must not be empty")]
    EmptyTerm,

    #[error("multiplexer session_prefix must be non-empty and contain only [A-Za-z0-9_-], got {0:?}")]
    InvalidSessionPrefix(String),

    #[error("multiplexer probe_timeout_secs must be at least 1, got {0}")]
    InvalidProbeTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Paths and logging.
    pub general: GeneralConfig,

    /// Session list and terminal cache limits.
    pub sessions: SessionsConfig,

    /// SSH connection settings.
    pub transport: TransportConfig,

    /// Automatic reconnection policy.
    pub reconnect: ReconnectConfig,

    /// Remote tmux integration.
    pub multiplexer: MultiplexerConfig,
}

/// Paths and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory for the session snapshot and log files.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write logs to daily files under `data_dir/logs`.
    pub log_to_file: bool,
}

/// Session list and terminal cache limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionsConfig {
    /// Maximum number of open sessions.
    pub max_sessions: usize,

    /// Number of live terminal surfaces kept in the LRU cache.
    pub terminal_cache_capacity: usize,

    /// Age after which an unfinished shell start is considered abandoned.
    pub pending_start_timeout_secs: u64,

    /// Delay between a session list change and the snapshot write.
    pub persist_debounce_ms: u64,

    pub default_cols: u16,
    pub default_rows: u16,
}

/// SSH connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Bound on TCP connect plus SSH handshake.
    pub connect_timeout_secs: u64,

    /// Seconds between keepalives (0 disables).
    pub keepalive_interval_secs: u64,

    /// Consecutive keepalive failures before the connection is dropped.
    pub keepalive_max_failures: u32,

    /// Terminal type requested for the PTY.
    pub term: String,
}

/// Automatic reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Default for new sessions' autoReconnect flag.
    pub auto_reconnect: bool,

    pub max_attempts: u32,

    /// First retry delay; doubles on each attempt.
    pub base_delay_ms: u64,
}

/// Remote tmux integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Run shells inside tmux by default.
    pub enabled: bool,

    /// Prefix for app-managed tmux session names.
    pub session_prefix: String,

    /// Try to install tmux when it is missing on the server.
    pub auto_install: bool,

    /// Upper bound on the pre-shell tmux probe.
    pub probe_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            terminal_cache_capacity: 20,
            pending_start_timeout_secs: 120,
            persist_debounce_ms: 300,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            keepalive_interval_secs: 30,
            keepalive_max_failures: 3,
            term: transport::target::DEFAULT_TERM.to_string(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            session_prefix: "vivy".to_string(),
            auto_install: false,
            probe_timeout_secs: 5,
        }
    }
}

impl SessionsConfig {
    pub fn pending_start_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_start_timeout_secs)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `None` when keepalives are disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

impl MultiplexerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vivyterm")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vivyterm")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - VIVY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - VIVY_MAX_SESSIONS: Override the session quota
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("VIVY_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.general.log_level = level;
            }
        }

        if let Ok(value) = std::env::var("VIVY_MAX_SESSIONS") {
            match value.trim().parse::<usize>() {
                Ok(max) => {
                    tracing::info!("Overriding max_sessions from environment: {}", max);
                    self.sessions.max_sessions = max;
                }
                Err(_) if value.is_empty() => {}
                Err(e) => {
                    tracing::warn!("Ignoring invalid VIVY_MAX_SESSIONS {:?}: {}", value, e);
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sessions.max_sessions < 1 || self.sessions.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.sessions.max_sessions));
        }

        if self.sessions.terminal_cache_capacity < 1 {
            return Err(ConfigError::InvalidCacheCapacity(
                self.sessions.terminal_cache_capacity,
            ));
        }

        if self.sessions.default_cols == 0 || self.sessions.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize(
                self.sessions.default_cols,
                self.sessions.default_rows,
            ));
        }

        if self.reconnect.max_attempts < 1 || self.reconnect.max_attempts > 10 {
            return Err(ConfigError::InvalidMaxAttempts(self.reconnect.max_attempts));
        }

        if self.transport.term.trim().is_empty() {
            return Err(ConfigError::EmptyTerm);
        }

        // The prefix ends up unquoted in remote shell commands.
        let prefix = &self.multiplexer.session_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::InvalidSessionPrefix(prefix.clone()));
        }

        if self.multiplexer.probe_timeout_secs < 1 {
            return Err(ConfigError::InvalidProbeTimeout(
                self.multiplexer.probe_timeout_secs,
            ));
        }

        let level = self.general.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level.clone()));
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

    /// Path of the persisted session snapshot.
    pub fn sessions_path(&self) -> PathBuf {
        self.general.data_dir.join("sessions.json")
    }

    /// Directory for rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.general.data_dir.join("logs")
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

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.general.log_level, "info");
        assert!(!config.general.log_to_file);
        assert_eq!(config.sessions.max_sessions, 32);
        assert_eq!(config.sessions.terminal_cache_capacity, 20);
        assert_eq!(config.sessions.pending_start_timeout(), Duration::from_secs(120));
        assert_eq!(config.sessions.persist_debounce(), Duration::from_millis(300));
        assert_eq!(config.transport.term, "xterm-256color");
        assert_eq!(config.transport.keepalive_interval(), Some(Duration::from_secs(30)));
        assert!(config.reconnect.auto_reconnect);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay(), Duration::from_secs(1));
        assert!(!config.multiplexer.enabled);
        assert_eq!(config.multiplexer.session_prefix, "vivy");
    }

    #[test]
    fn test_default_data_dir() {
        let config = GeneralConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("vivyterm"));
    }

    #[test]
    fn test_derived_paths() {
        let mut config = Config::default();
        config.general.data_dir = PathBuf::from("/data/vivy");
        assert_eq!(config.sessions_path(), PathBuf::from("/data/vivy/sessions.json"));
        assert_eq!(config.log_dir(), PathBuf::from("/data/vivy/logs"));
    }

    #[test]
    fn test_keepalive_disabled_by_zero() {
        let mut config = TransportConfig::default();
        config.keepalive_interval_secs = 0;
        assert_eq!(config.keepalive_interval(), None);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[general]
log_level = "debug"

[sessions]
max_sessions = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.sessions.max_sessions, 5);
        // Other values should be defaults
        assert_eq!(config.sessions.terminal_cache_capacity, 20);
        assert_eq!(config.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[general]
data_dir = "/custom/data"
log_level = "trace"
log_to_file = true

[sessions]
max_sessions = 8
terminal_cache_capacity = 4
pending_start_timeout_secs = 60
persist_debounce_ms = 50
default_cols = 120
default_rows = 40

[transport]
connect_timeout_secs = 5
keepalive_interval_secs = 10
keepalive_max_failures = 2
term = "xterm"

[reconnect]
auto_reconnect = false
max_attempts = 5
base_delay_ms = 250

[multiplexer]
enabled = true
session_prefix = "work"
auto_install = true
probe_timeout_secs = 2
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.general.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.general.log_level, "trace");
        assert!(config.general.log_to_file);
        assert_eq!(config.sessions.max_sessions, 8);
        assert_eq!(config.sessions.terminal_cache_capacity, 4);
        assert_eq!(config.sessions.pending_start_timeout_secs, 60);
        assert_eq!(config.sessions.persist_debounce_ms, 50);
        assert_eq!(config.sessions.default_cols, 120);
        assert_eq!(config.sessions.default_rows, 40);
        assert_eq!(config.transport.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.transport.keepalive_max_failures, 2);
        assert_eq!(config.transport.term, "xterm");
        assert!(!config.reconnect.auto_reconnect);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.base_delay_ms, 250);
        assert!(config.multiplexer.enabled);
        assert_eq!(config.multiplexer.session_prefix, "work");
        assert!(config.multiplexer.auto_install);
        assert_eq!(config.multiplexer.probe_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[general
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[sessions]
max_sessions = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[general]
log_level = "warn"
colour_scheme = "dracula"

[extras]
anything = 1
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.general.log_level, "warn");
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let mut original = Config::default();
        original.general.log_level = "warn".to_string();
        original.sessions.max_sessions = 42;
        original.multiplexer.enabled = true;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[multiplexer]"));
        let loaded = Config::from_toml(&toml).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("config.toml");

        let mut config = Config::default();
        config.reconnect.base_delay_ms = 500;
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is not [valid toml").unwrap();

        let err = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("vivyterm/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("VIVY_MAX_SESSIONS");
        std::env::set_var("VIVY_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.general.log_level, "debug");

        std::env::remove_var("VIVY_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("VIVY_LOG_LEVEL", "");
        std::env::set_var("VIVY_MAX_SESSIONS", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("VIVY_LOG_LEVEL");
        std::env::remove_var("VIVY_MAX_SESSIONS");
    }

    #[test]
    #[serial]
    fn test_env_override_max_sessions() {
        std::env::remove_var("VIVY_LOG_LEVEL");
        std::env::set_var("VIVY_MAX_SESSIONS", "7");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.sessions.max_sessions, 7);

        std::env::set_var("VIVY_MAX_SESSIONS", "lots");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.sessions.max_sessions, 32);

        std::env::remove_var("VIVY_MAX_SESSIONS");
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions_bounds() {
        let mut config = Config::default();
        config.sessions.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.sessions.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.sessions.max_sessions = 1;
        assert!(config.validate().is_ok());
        config.sessions.max_sessions = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_cache_capacity() {
        let mut config = Config::default();
        config.sessions.terminal_cache_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidCacheCapacity(0)));
    }

    #[test]
    fn test_validate_terminal_size() {
        let mut config = Config::default();
        config.sessions.default_rows = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTerminalSize(80, 0)));
    }

    #[test]
    fn test_validate_max_attempts() {
        let mut config = Config::default();
        config.reconnect.max_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxAttempts(0)));
        config.reconnect.max_attempts = 11;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxAttempts(11)));
        config.reconnect.max_attempts = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_term_and_prefix() {
        let mut config = Config::default();
        config.transport.term = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyTerm));

        let mut config = Config::default();
        config.multiplexer.session_prefix = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSessionPrefix(_))
        ));

        config.multiplexer.session_prefix = "a b;rm".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSessionPrefix(_))
        ));

        config.multiplexer.session_prefix = "my_team-1".to_string();
        assert!(config.validate().is_ok());

        config.multiplexer.probe_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidProbeTimeout(0)));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.general.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.general.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());
    }
}
