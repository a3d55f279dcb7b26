//! Configuration management for the TermHub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termhub/config.toml`.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{BackendKind, RemoteOptions, SessionOptions};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("idle_timeout_secs must be at least 1, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("sweep_interval_secs must be at least 1, got {0}")]
    InvalidSweepInterval(u64),

    #[error("output_buffer must be at least 1, got {0}")]
    InvalidOutputBuffer(usize),

    #[error("terminal size must be non-zero, got {0}x{1}")]
    InvalidTerminalSize(u16, u16),

    #[error("bind_addr is not a valid socket address: {0}")]
    InvalidBindAddr(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("token digest for principal '{0}' must be 64 hex characters")]
    InvalidTokenDigest(String),

    #[error("duplicate target id: {0}")]
    DuplicateTarget(String),

    #[error("target '{0}' has a host but no username")]
    MissingTargetUsername(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the TermHub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket listener configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Accepted client tokens.
    pub auth: AuthConfig,

    /// Remote shell settings.
    pub ssh: SshConfig,

    /// Known session targets.
    pub targets: TargetsConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data (audit log).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,

    /// Write session audit events to `data_dir/audit.jsonl`.
    pub audit_file: bool,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the gateway listens on.
    pub bind_addr: String,

    /// Largest accepted client frame in bytes.
    pub max_frame_bytes: usize,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell started for every session.
    pub default_shell: String,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Sessions idle for longer than this are destroyed (default: 30 minutes).
    pub idle_timeout_secs: u64,

    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,

    /// Per-session output queue, in chunks of up to 4 KiB.
    pub output_buffer: usize,

    /// Process backend: auto, pty or pipe.
    pub backend: BackendKind,

    /// Initial terminal width when the client does not send one.
    pub cols: u16,

    /// Initial terminal height when the client does not send one.
    pub rows: u16,
}

/// Accepted client tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenEntry>,
}

/// One accepted token, stored as its SHA-256 digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenEntry {
    /// Name the token authenticates as.
    pub principal: String,
    /// Hex SHA-256 of the token (see `termhub hash-token`).
    pub sha256: String,
}

/// Remote shell settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    /// ssh binary.
    pub program: String,

    /// Key used when a target does not name one.
    pub default_key: Option<PathBuf>,

    /// ssh ConnectTimeout in seconds.
    pub connect_timeout_secs: u64,

    /// Honor `connection` parameters sent by the client in `init`.
    pub allow_client_params: bool,
}

/// Known session targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TargetsConfig {
    /// Remove the built-in `local` target.
    pub disable_local: bool,

    /// Configured targets.
    pub entries: Vec<TargetConfig>,
}

/// One configured target. Without a host it is a local shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
            audit_file: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7682".to_string(),
            max_frame_bytes: protocol::MAX_FRAME_SIZE,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            max_sessions: 50,
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
            output_buffer: 256,
            backend: BackendKind::Auto,
            cols: protocol::DEFAULT_COLS,
            rows: protocol::DEFAULT_ROWS,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            default_key: None,
            connect_timeout_secs: 10,
            allow_client_params: false,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
}

/// Returns the default shell for the current user.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMHUB_BIND_ADDR: Override the gateway listen address
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(addr) = std::env::var("TERMHUB_BIND_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_addr from environment: {}", addr);
                self.server.bind_addr = addr;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }
        if session.idle_timeout_secs < 1 {
            return Err(ConfigError::InvalidIdleTimeout(session.idle_timeout_secs));
        }
        if session.sweep_interval_secs < 1 {
            return Err(ConfigError::InvalidSweepInterval(session.sweep_interval_secs));
        }
        if session.output_buffer < 1 {
            return Err(ConfigError::InvalidOutputBuffer(session.output_buffer));
        }
        if session.cols == 0 || session.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize(session.cols, session.rows));
        }

        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.server.bind_addr.clone()));
        }

        // Absolute shells must exist; bare names are looked up on PATH.
        let shell_path = Path::new(&session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        for token in &self.auth.tokens {
            let digest = token.sha256.trim();
            if digest.len() != 64 || hex::decode(digest).is_err() {
                return Err(ConfigError::InvalidTokenDigest(token.principal.clone()));
            }
        }

        let mut seen = HashSet::new();
        for target in &self.targets.entries {
            if !seen.insert(target.id.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.id.clone()));
            }
            if target.host.is_some() && target.username.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::MissingTargetUsername(target.id.clone()));
            }
        }

        Ok(())
    }

    /// Session settings derived from the `[session]` and `[ssh]` sections.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            shell: self.session.default_shell.clone(),
            cols: self.session.cols,
            rows: self.session.rows,
            env: Vec::new(),
            cwd: None,
            output_buffer: self.session.output_buffer,
            remote: RemoteOptions {
                ssh_program: self.ssh.program.clone(),
                connect_timeout_secs: self.ssh.connect_timeout_secs,
                default_key: self.ssh.default_key.clone(),
            },
        }
    }

    /// Path of the JSON-lines audit log.
    pub fn audit_log_path(&self) -> PathBuf {
        self.daemon.data_dir.join("audit.jsonl")
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
