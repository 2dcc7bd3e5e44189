//! Configuration module for the prime server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::orchestrator::StoreFailurePolicy;
use crate::worker::ProcessDispatcher;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the prime server
#[derive(Parser, Debug)]
#[command(name = "prime-cache")]
#[command(version)]
#[command(about = "Primality server with a Redis cache-aside layer", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind to
    #[arg(short = 'l', long)]
    pub host: Option<String>,

    /// Cache backend
    #[arg(long, value_enum)]
    pub cache: Option<CacheBackend>,

    /// Redis URL (e.g., redis://127.0.0.1:6379)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Maximum concurrent worker processes (0 = unbounded)
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Run as a single-task worker process
    #[arg(long, hide = true)]
    pub worker: bool,
}

/// Where answers are cached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// External Redis server
    #[default]
    Redis,
    /// In-process map, lost on restart
    Memory,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Cache-related configuration
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Connections in the Redis pool
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Fail the request when storing a computed answer fails
    #[serde(default)]
    pub fail_on_store_error: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            redis_url: default_redis_url(),
            pool_size: default_pool_size(),
            command_timeout_ms: default_command_timeout_ms(),
            fail_on_store_error: false,
        }
    }
}

/// Worker-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct WorkerConfig {
    /// Worker executable (defaults to this binary in worker mode)
    pub program: Option<PathBuf>,
    /// Arguments passed to `program`
    #[serde(default)]
    pub args: Vec<String>,
    /// Maximum concurrent workers (0 = unbounded)
    #[serde(default)]
    pub max_workers: usize,
    /// Worker timeout in milliseconds (unset = wait forever)
    pub timeout_ms: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8070
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_command_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub worker_mode: bool,
    pub host: String,
    pub port: u16,
    pub cache_backend: CacheBackend,
    pub redis_url: String,
    pub redis_pool_size: usize,
    pub command_timeout_ms: u64,
    pub fail_on_store_error: bool,
    pub worker_program: Option<PathBuf>,
    pub worker_args: Vec<String>,
    pub max_workers: usize,
    pub worker_timeout_ms: Option<u64>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

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

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            worker_mode: cli.worker,
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            cache_backend: cli.cache.unwrap_or(toml_config.cache.backend),
            redis_url: cli.redis_url.unwrap_or(toml_config.cache.redis_url),
            redis_pool_size: toml_config.cache.pool_size,
            command_timeout_ms: toml_config.cache.command_timeout_ms,
            fail_on_store_error: toml_config.cache.fail_on_store_error,
            worker_program: toml_config.worker.program,
            worker_args: toml_config.worker.args,
            max_workers: cli.max_workers.unwrap_or(toml_config.worker.max_workers),
            worker_timeout_ms: toml_config.worker.timeout_ms,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Address the server binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_policy(&self) -> StoreFailurePolicy {
        if self.fail_on_store_error {
            StoreFailurePolicy::Fail
        } else {
            StoreFailurePolicy::Respond
        }
    }

    /// Build the worker dispatcher described by this configuration
    pub fn dispatcher(&self) -> std::io::Result<ProcessDispatcher> {
        let dispatcher = match &self.worker_program {
            Some(program) => ProcessDispatcher::new(program, self.worker_args.clone()),
            None => ProcessDispatcher::current_exe()?,
        };

        Ok(dispatcher
            .with_max_workers(self.max_workers)
            .with_timeout(self.worker_timeout_ms.map(Duration::from_millis)))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["prime-cache"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8070);
        assert_eq!(config.cache.backend, CacheBackend::Redis);
        assert_eq!(config.cache.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.worker.max_workers, 0);
        assert_eq!(config.worker.timeout_ms, None);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [cache]
            backend = "memory"
            pool_size = 8
            fail_on_store_error = true

            [worker]
            program = "/usr/local/bin/prime-worker"
            args = ["--fast"]
            max_workers = 16
            timeout_ms = 5000

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.cache.backend, CacheBackend::Memory);
        assert_eq!(config.cache.pool_size, 8);
        assert!(config.cache.fail_on_store_error);
        assert_eq!(
            config.worker.program,
            Some(PathBuf::from("/usr/local/bin/prime-worker"))
        );
        assert_eq!(config.worker.args, vec!["--fast"]);
        assert_eq!(config.worker.max_workers, 16);
        assert_eq!(config.worker.timeout_ms, Some(5000));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            [worker]
            max_workers = 16
            "#,
        )
        .unwrap();

        let config = Config::merge(cli(&["-p", "7000", "--cache", "memory"]), toml_config);
        assert_eq!(config.port, 7000);
        assert_eq!(config.cache_backend, CacheBackend::Memory);
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.listen_addr(), "0.0.0.0:7000");
        assert_eq!(config.store_policy(), StoreFailurePolicy::Respond);
        assert!(!config.worker_mode);
    }

    #[test]
    fn test_log_level_override() {
        let toml_config = || -> TomlConfig {
            toml::from_str(
                r#"
                [logging]
                level = "debug"
                "#,
            )
            .unwrap()
        };

        let config = Config::merge(cli(&["--log-level", "info"]), toml_config());
        assert_eq!(config.log_level, "info");

        let config = Config::merge(cli(&[]), toml_config());
        assert_eq!(config.log_level, "debug");

        let config = Config::merge(cli(&[]), TomlConfig::default());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_worker_flag() {
        let config = Config::from_cli(cli(&["--worker"])).unwrap();
        assert!(config.worker_mode);
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::from_cli(cli(&["--config", "/nonexistent/prime-cache.toml"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(_, _)));
    }

    #[test]
    fn test_configured_dispatcher() {
        let config = Config::merge(cli(&["-w", "2"]), TomlConfig::default());
        let dispatcher = config.dispatcher().unwrap();
        assert_eq!(dispatcher.available_slots(), Some(2));
    }
}
