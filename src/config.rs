//! Configuration module for the ws-reactor server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the WebSocket server
#[derive(Parser, Debug)]
#[command(name = "ws-reactor")]
#[command(author = "ws-reactor authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded WebSocket server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7777 or unix:/tmp/ws.sock)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Stop the server after this many seconds (0 = run until stopped)
    #[arg(short = 't', long)]
    pub time_limit: Option<u64>,

    /// Print lifecycle events to the console
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Append lifecycle events to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Application handler to run
    #[arg(long, value_enum)]
    pub handler: Option<HandlerKind>,

    /// Maximum number of simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Demo application handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Send every message back
    Echo,
    /// Answer date/time/country/city lookups
    Command,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Time budget in seconds (0 = unbounded)
    #[serde(default)]
    pub time_limit: u64,
    /// Application handler
    #[serde(default = "default_handler")]
    pub handler: HandlerKind,
    /// Connection cap
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Upper bound of a single socket read in bytes
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Largest accepted frame payload in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            time_limit: 0,
            handler: default_handler(),
            max_connections: default_max_connections(),
            read_chunk: default_read_chunk(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Print lifecycle events to the console
    #[serde(default)]
    pub verbose: bool,
    /// Append lifecycle events to this file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            verbose: false,
            file: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_handler() -> HandlerKind {
    HandlerKind::Echo
}

fn default_max_connections() -> usize {
    1024
}

fn default_read_chunk() -> usize {
    100_000
}

fn default_max_frame_size() -> u64 {
    16 * 1024 * 1024 // 16 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    /// Seconds; 0 = unbounded
    pub time_limit: u64,
    pub verbose: bool,
    /// Log file; `Some` enables file logging
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub handler: HandlerKind,
    pub max_connections: usize,
    pub read_chunk: usize,
    pub max_frame_size: u64,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            time_limit: cli.time_limit.unwrap_or(toml_config.server.time_limit),
            verbose: cli.verbose || toml_config.logging.verbose,
            log_file: cli.log_file.or(toml_config.logging.file),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            handler: cli.handler.unwrap_or(toml_config.server.handler),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            read_chunk: toml_config.server.read_chunk,
            max_frame_size: toml_config.server.max_frame_size,
        };

        if config.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections must be at least 1"));
        }
        if config.read_chunk == 0 {
            return Err(ConfigError::InvalidValue("read_chunk must be at least 1"));
        }

        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidValue(&'static str),
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
            ConfigError::InvalidValue(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["ws-reactor"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7777");
        assert_eq!(config.server.time_limit, 0);
        assert_eq!(config.server.handler, HandlerKind::Echo);
        assert_eq!(config.server.read_chunk, 100_000);
        assert!(!config.logging.verbose);
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            time_limit = 100
            handler = "command"
            max_connections = 16

            [logging]
            level = "debug"
            verbose = true
            file = "ws-log.txt"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.time_limit, 100);
        assert_eq!(config.server.handler, HandlerKind::Command);
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(config.server.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.verbose);
        assert_eq!(config.logging.file, Some(PathBuf::from("ws-log.txt")));
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            time_limit = 100
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["-l", "127.0.0.1:8000", "-t", "5", "--handler", "command", "-v"]),
            toml_config,
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:8000");
        assert_eq!(config.time_limit, 5);
        assert_eq!(config.handler, HandlerKind::Command);
        assert!(config.verbose);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_zero_connections_rejected() {
        let err = Config::merge(cli(&["--max-connections", "0"]), TomlConfig::default());
        assert!(matches!(err, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::resolve(cli(&["-c", "/nonexistent/ws-reactor.toml"]));
        assert!(matches!(err, Err(ConfigError::FileRead(..))));
    }
}
