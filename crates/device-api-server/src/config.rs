use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use api_types::validation::is_dns1123_subdomain;
use clap::Parser;
use core::error::Error;
use derive_more::Display;
use error_stack::Report;
use utils::version;

use crate::storage::StorageConfig;

pub const DEFAULT_BIND_ADDRESS: &str = "unix:///var/run/nvidia-device-api/device-api.sock";
const UNIX_SCHEME: &str = "unix://";
const MAX_COMPACTION_BATCH_SIZE: i64 = 10_000_000;

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[display("bind address {address:?} must be unix:// followed by an absolute path")]
    InvalidBindAddress { address: String },

    #[display("node name {name:?} is not a valid DNS-1123 subdomain")]
    InvalidNodeName { name: String },

    #[display("node name is empty and the hostname could not be determined")]
    MissingNodeName,

    #[display("compaction batch size {value} must be between 1 and {}", MAX_COMPACTION_BATCH_SIZE)]
    InvalidCompactionBatchSize { value: i64 },
}

impl Error for ConfigError {}

/// Node-local GPU device API server
#[derive(Parser, Debug, Clone)]
#[command(
    about,
    long_about,
    version = &**version::VERSION,
    long_version = &**version::LONG_VERSION
)]
pub struct Args {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Node name this server is authoritative for, defaults to the system hostname"
    )]
    pub hostname_override: Option<String>,

    #[arg(
        long,
        env = "DEVICE_API_BIND_ADDRESS",
        default_value = DEFAULT_BIND_ADDRESS,
        help = "Unix socket the device API listens on, e.g. unix:///run/device-api.sock"
    )]
    pub bind_address: String,

    #[arg(
        long,
        env = "DEVICE_API_HEALTH_PROBE_BIND_ADDRESS",
        default_value = "127.0.0.1:50051",
        help = "TCP address serving gRPC health and reflection"
    )]
    pub health_probe_bind_address: SocketAddr,

    #[arg(
        long,
        env = "DEVICE_API_METRICS_BIND_ADDRESS",
        default_value = "127.0.0.1:9090",
        help = "TCP address serving Prometheus metrics on /metrics"
    )]
    pub metrics_bind_address: SocketAddr,

    #[arg(
        long,
        env = "DEVICE_API_SHUTDOWN_GRACE_PERIOD",
        default_value = "25s",
        value_parser = parse_duration,
        help = "How long in-flight requests may run after a shutdown signal"
    )]
    pub shutdown_grace_period: Duration,

    #[arg(
        long,
        env = "DEVICE_API_DATABASE_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "SQLite database file; state is kept in memory when unset"
    )]
    pub database_path: Option<PathBuf>,

    #[arg(
        long,
        env = "DEVICE_API_COMPACTION_INTERVAL",
        default_value = "5m",
        value_parser = parse_duration,
        help = "Interval between history compactions, 0s disables compaction"
    )]
    pub compaction_interval: Duration,

    #[arg(
        long,
        env = "DEVICE_API_COMPACTION_BATCH_SIZE",
        default_value = "1000",
        help = "Maximum revisions discarded per compaction pass"
    )]
    pub compaction_batch_size: i64,

    #[arg(
        long,
        env = "DEVICE_API_WATCH_PROGRESS_NOTIFY_INTERVAL",
        default_value = "5s",
        value_parser = parse_duration,
        help = "Interval between bookmarks on idle watch streams, 0s disables them"
    )]
    pub watch_progress_notify_interval: Duration,
}

/// Validated server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub node_name: String,
    pub socket_path: PathBuf,
    pub health_probe_address: SocketAddr,
    pub metrics_address: SocketAddr,
    pub shutdown_grace_period: Duration,
    pub storage: StorageConfig,
    pub progress_notify_interval: Option<Duration>,
}

impl ServerConfig {
    /// Settings for an in-memory server on `socket_path` with ephemeral TCP
    /// ports, used by tests and embedders.
    pub fn local(node_name: &str, socket_path: impl Into<PathBuf>) -> Self {
        let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
        Self {
            node_name: node_name.to_lowercase(),
            socket_path: socket_path.into(),
            health_probe_address: loopback,
            metrics_address: loopback,
            shutdown_grace_period: Duration::from_secs(5),
            storage: StorageConfig::default(),
            progress_notify_interval: Some(Duration::from_secs(5)),
        }
    }
}

impl TryFrom<Args> for ServerConfig {
    type Error = Report<ConfigError>;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let node_name = match args.hostname_override.filter(|n| !n.trim().is_empty()) {
            Some(name) => name.trim().to_lowercase(),
            None => system_hostname().ok_or_else(|| Report::new(ConfigError::MissingNodeName))?,
        };
        if !is_dns1123_subdomain(&node_name) {
            return Err(Report::new(ConfigError::InvalidNodeName { name: node_name }));
        }

        let socket_path = parse_bind_address(&args.bind_address)?;

        if !(1..=MAX_COMPACTION_BATCH_SIZE).contains(&args.compaction_batch_size) {
            return Err(Report::new(ConfigError::InvalidCompactionBatchSize {
                value: args.compaction_batch_size,
            }));
        }

        Ok(Self {
            node_name,
            socket_path,
            health_probe_address: args.health_probe_bind_address,
            metrics_address: args.metrics_bind_address,
            shutdown_grace_period: args.shutdown_grace_period,
            storage: StorageConfig {
                database_path: args.database_path,
                compaction_interval: non_zero(args.compaction_interval),
                compaction_batch_size: args.compaction_batch_size,
            },
            progress_notify_interval: non_zero(args.watch_progress_notify_interval),
        })
    }
}

/// Extracts the socket path from a `unix://` bind address.
pub fn parse_bind_address(address: &str) -> Result<PathBuf, Report<ConfigError>> {
    let invalid = || {
        Report::new(ConfigError::InvalidBindAddress {
            address: address.to_string(),
        })
    };
    let path = address.strip_prefix(UNIX_SCHEME).ok_or_else(invalid)?;
    if !Path::new(path).is_absolute() {
        return Err(invalid());
    }
    Ok(PathBuf::from(path))
}

/// Parses `<n>ms`, `<n>s`, `<n>m` or `<n>h`.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration {value:?} is missing a unit (ms, s, m, h)"))?;
    let (amount, unit) = value.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|e| format!("invalid duration {value:?}: {e}"))?;
    let seconds_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(amount)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(format!("unknown duration unit {unit:?} in {value:?}")),
    };
    amount
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration {value:?} is too large"))
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

fn system_hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
}
