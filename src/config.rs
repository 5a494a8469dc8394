//! Configuration module for echo-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults. The resolved configuration is
//! immutable for the lifetime of a run.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echo-bench")]
#[command(version = "0.1.0")]
#[command(
    about = "TCP echo server and round-trip latency/throughput load generator",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub role: RoleArgs,
}

#[derive(Subcommand, Debug)]
pub enum RoleArgs {
    /// Run the echo server
    Server(ServerArgs),
    /// Run the load generator
    Client(ClientArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// Address to listen on
    pub host: Option<String>,

    /// Port to listen on
    pub port: Option<u16>,

    /// Number of echo workers (defaults to number of CPU cores)
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// listen(2) backlog
    #[arg(short, long)]
    pub backlog: Option<u32>,

    /// Capacity of the accepted-connection queue
    #[arg(long)]
    pub queue_depth: Option<usize>,

    /// How long in-flight connections may finish after an interrupt
    #[arg(long)]
    pub shutdown_grace_ms: Option<u64>,
}

#[derive(Args, Debug, Default)]
pub struct ClientArgs {
    /// Echo server host
    pub host: Option<String>,

    /// Echo server port
    pub port: Option<u16>,

    /// Number of concurrent workers (defaults to number of CPU cores)
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Payload size in bytes
    #[arg(short = 'm', long)]
    pub payload_size: Option<u64>,

    /// Length of the reporting window in seconds
    #[arg(short, long, conflicts_with = "repetitions")]
    pub duration: Option<u64>,

    /// Length of the warmup period in seconds
    #[arg(short, long, conflicts_with = "repetitions")]
    pub warmup: Option<u64>,

    /// Run a fixed number of round trips instead of a timed experiment
    #[arg(short, long)]
    pub repetitions: Option<u64>,

    /// Local wall-clock start time (HH:MM:SS), for coordinating several clients
    #[arg(short, long)]
    pub start: Option<String>,

    /// Connect timeout in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Set TCP_NODELAY on client sockets
    #[arg(long)]
    pub nodelay: Option<bool>,

    /// Identifier printed in worker markers
    #[arg(long)]
    pub id: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub concurrency: Option<usize>,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            concurrency: None,
            backlog: default_backlog(),
            queue_depth: default_queue_depth(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub concurrency: Option<usize>,
    #[serde(default = "default_payload_size")]
    pub payload_size: u64,
    #[serde(default = "default_duration")]
    pub duration_secs: u64,
    #[serde(default = "default_warmup")]
    pub warmup_secs: u64,
    pub repetitions: Option<u64>,
    pub start: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    pub id: Option<String>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            concurrency: None,
            payload_size: default_payload_size(),
            duration_secs: default_duration(),
            warmup_secs: default_warmup(),
            repetitions: None,
            start: None,
            connect_timeout_ms: default_connect_timeout(),
            nodelay: default_nodelay(),
            id: None,
        }
    }
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
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_backlog() -> u32 {
    1024
}

fn default_queue_depth() -> usize {
    1024
}

fn default_shutdown_grace() -> u64 {
    5000
}

fn default_payload_size() -> u64 {
    1
}

fn default_duration() -> u64 {
    60
}

fn default_warmup() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_nodelay() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub enum Role {
    Server(ServerConfig),
    Client(ClientConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub concurrency: usize,
    pub backlog: u32,
    pub queue_depth: usize,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub concurrency: usize,
    pub payload_size: u64,
    pub mode: Mode,
    pub start: Option<DateTime<Local>>,
    pub connect_timeout: Duration,
    pub nodelay: bool,
    pub client_id: String,
}

/// How long each worker keeps issuing round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Run until `warmup + duration` has elapsed, reporting only samples
    /// that complete inside the window after `warmup`.
    Timed { duration: Duration, warmup: Duration },
    /// Run exactly `repetitions` round trips across all workers.
    Counted { repetitions: u64 },
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let log_level = if cli.verbose {
            "debug".to_string()
        } else {
            cli.log_level.unwrap_or(toml_config.logging.level)
        };

        let role = match cli.role {
            RoleArgs::Server(args) => Role::Server(resolve_server(args, toml_config.server)?),
            RoleArgs::Client(args) => {
                Role::Client(resolve_client(args, toml_config.client, Local::now())?)
            }
        };

        Ok(Config { role, log_level })
    }
}

fn resolve_server(args: ServerArgs, file: ServerSection) -> Result<ServerConfig, ConfigError> {
    let concurrency = args
        .concurrency
        .or(file.concurrency)
        .unwrap_or_else(default_concurrency);
    if concurrency == 0 {
        return Err(ConfigError::Invalid("concurrency must be at least 1"));
    }

    let queue_depth = args.queue_depth.unwrap_or(file.queue_depth);
    if queue_depth == 0 {
        return Err(ConfigError::Invalid("queue depth must be at least 1"));
    }

    Ok(ServerConfig {
        host: args.host.unwrap_or(file.host),
        port: args.port.unwrap_or(file.port),
        concurrency,
        backlog: args.backlog.unwrap_or(file.backlog),
        queue_depth,
        shutdown_grace: Duration::from_millis(
            args.shutdown_grace_ms.unwrap_or(file.shutdown_grace_ms),
        ),
    })
}

fn resolve_client(
    args: ClientArgs,
    file: ClientSection,
    now: DateTime<Local>,
) -> Result<ClientConfig, ConfigError> {
    let concurrency = args
        .concurrency
        .or(file.concurrency)
        .unwrap_or_else(default_concurrency);
    if concurrency == 0 {
        return Err(ConfigError::Invalid("concurrency must be at least 1"));
    }

    let payload_size = args.payload_size.unwrap_or(file.payload_size);
    if payload_size == 0 {
        return Err(ConfigError::Invalid("payload size must be at least 1 byte"));
    }

    // An explicit duration on the command line wins over a file-level
    // repetition count.
    let timed_on_cli = args.duration.is_some() || args.warmup.is_some();
    let repetitions = if timed_on_cli {
        None
    } else {
        args.repetitions.or(file.repetitions)
    };
    let mode = match repetitions {
        Some(0) => return Err(ConfigError::Invalid("repetitions must be at least 1")),
        Some(repetitions) => Mode::Counted { repetitions },
        None => {
            let duration = args.duration.unwrap_or(file.duration_secs);
            if duration == 0 {
                return Err(ConfigError::Invalid("duration must be at least 1 second"));
            }
            Mode::Timed {
                duration: Duration::from_secs(duration),
                warmup: Duration::from_secs(args.warmup.unwrap_or(file.warmup_secs)),
            }
        }
    };

    let start = match args.start.or(file.start) {
        Some(s) => Some(parse_start(&s, now.date_naive())?),
        None => None,
    };

    let host = args.host.unwrap_or(file.host);
    let client_id = args
        .id
        .or(file.id)
        .unwrap_or_else(|| format!("{}-{}", host, std::process::id()));

    Ok(ClientConfig {
        port: args.port.unwrap_or(file.port),
        host,
        concurrency,
        payload_size,
        mode,
        start,
        connect_timeout: Duration::from_millis(
            args.connect_timeout_ms.unwrap_or(file.connect_timeout_ms),
        ),
        nodelay: args.nodelay.unwrap_or(file.nodelay),
        client_id,
    })
}

/// Parse an `HH:MM:SS` start time as a local wall-clock instant on `today`.
pub fn parse_start(s: &str, today: NaiveDate) -> Result<DateTime<Local>, ConfigError> {
    let time = NaiveTime::parse_from_str(s, "%H:%M:%S")
        .map_err(|e| ConfigError::StartTime(s.to_string(), e.to_string()))?;
    Local
        .from_local_datetime(&NaiveDateTime::new(today, time))
        .earliest()
        .ok_or_else(|| {
            ConfigError::StartTime(s.to_string(), "no such local time today".to_string())
        })
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    FileRead { path: PathBuf, source: std::io::Error },
    #[error("Failed to parse config file {path:?}: {source}")]
    TomlParse { path: PathBuf, source: toml::de::Error },
    #[error("Invalid start time '{0}': {1}")]
    StartTime(String, String),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
