//! Configuration module for the framed-reactor server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Readiness backend used by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// mio: epoll on Linux, kqueue on macOS (edge-triggered).
    #[default]
    Mio,
    /// Plain poll(2), level-triggered.
    Poll,
}

/// Built-in message handler selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Send every payload back unchanged.
    #[default]
    Echo,
    /// Answer every payload with `ok`.
    Ack,
    /// Answer with a short text reply quoting the payload.
    Reply,
}

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "framed-reactor")]
#[command(author = "framed-reactor authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-reactor server for length-prefixed messages", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8100)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Largest accepted payload in bytes (length prefix excluded)
    #[arg(short = 'm', long)]
    pub max_message_size: Option<usize>,

    /// Maximum number of live connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Readiness backend
    #[arg(short = 'b', long, value_enum)]
    pub backend: Option<Backend>,

    /// Message handler
    #[arg(long, value_enum)]
    pub handler: Option<HandlerKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub handler: HandlerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum number of live connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest accepted payload in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Reactor-related configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub backend: Backend,
    /// Readiness events collected per wait
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Upper bound on a single wait, in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            event_capacity: default_event_capacity(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Handler selection
#[derive(Debug, Deserialize, Default)]
pub struct HandlerConfig {
    #[serde(default)]
    pub kind: HandlerKind,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_listen() -> String {
    "0.0.0.0:8100".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    4096
}

fn default_event_capacity() -> usize {
    1024
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: u32,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub backend: Backend,
    pub event_capacity: usize,
    pub poll_timeout_ms: u64,
    pub handler: HandlerKind,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve configuration from parsed CLI args.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: toml_config.server.backlog,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            max_message_size: cli
                .max_message_size
                .unwrap_or(toml_config.server.max_message_size),
            backend: cli.backend.unwrap_or(toml_config.runtime.backend),
            event_capacity: toml_config.runtime.event_capacity,
            poll_timeout_ms: toml_config.runtime.poll_timeout_ms,
            handler: cli.handler.unwrap_or(toml_config.handler.kind),
            log_level: if !cli.log_level.is_empty() && cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_message_size must be between 1 and {}, got {}",
                u32::MAX,
                self.max_message_size
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
