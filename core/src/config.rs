/// Configuration management
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_PORT: u16 = 40000;

/// Pairwise stats tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Ring size per relay pair (samples)
    pub history_size: usize,

    /// A pair that has not reported for longer than this is poisoned on its next sample
    pub stale_timeout: Duration,

    /// A relay that has not reported for longer than this is offline
    pub liveness_timeout: Duration,

    /// A relay silent for longer than this is forgotten along with its pairs
    pub relay_retention: Duration,

    /// Mean jitter ceiling (ms) for either direction of a routable pair
    pub max_jitter: f32,

    /// Mean packet loss ceiling (%) for either direction of a routable pair
    pub max_packet_loss: f32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            history_size: 300,
            stale_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(10),
            relay_retention: Duration::from_secs(30),
            max_jitter: 100.0,
            max_packet_loss: 1.0,
        }
    }
}

/// Route optimizer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// An indirect leg must beat the direct cost by more than this many ms
    pub cost_threshold: i32,

    /// Waypoint candidates kept per ordered relay pair
    pub max_indirects: usize,

    /// Routes kept per relay pair
    pub max_routes_per_entry: usize,

    /// Longest relay sequence a route may carry (2 to 5)
    pub max_route_relays: usize,

    /// Worker segments per pass (0 = one per relay)
    pub segments: usize,

    /// Drop routes that visit two relays in the same datacenter
    pub datacenter_filter: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            cost_threshold: 5,
            max_indirects: 5,
            max_routes_per_entry: 8,
            max_route_relays: 5,
            segments: 0,
            datacenter_filter: true,
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address of the JSON-lines API (relay reports, status queries)
    pub api_addr: SocketAddr,

    /// How often the stats snapshot is optimized and published
    pub optimize_interval: Duration,

    /// Where the encoded route matrix is written after each pass
    pub output_path: Option<PathBuf>,

    /// Directory for the optimize log (defaults to `logs/`)
    pub log_dir: Option<PathBuf>,

    /// Relay directory file (JSON array of relays) used for status reporting
    pub relay_directory: Option<PathBuf>,

    pub stats: StatsConfig,

    pub optimizer: OptimizerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT)),
            optimize_interval: Duration::from_secs(1),
            output_path: None,
            log_dir: None,
            relay_directory: None,
            stats: StatsConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();
        let mut api_port: Option<u16> = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api-port" => {
                    api_port = Some(parse_value(args, i, "--api-port")?);
                    i += 2;
                }
                "--interval-secs" => {
                    let secs: u64 = parse_value(args, i, "--interval-secs")?;
                    if secs == 0 {
                        return Err(CoreError::Config(
                            "--interval-secs must be at least 1".to_string(),
                        ));
                    }
                    config.optimize_interval = Duration::from_secs(secs);
                    i += 2;
                }
                "--segments" => {
                    config.optimizer.segments = parse_value(args, i, "--segments")?;
                    i += 2;
                }
                "--output" => {
                    let path: String = parse_value(args, i, "--output")?;
                    config.output_path = Some(PathBuf::from(path));
                    i += 2;
                }
                "--log-dir" => {
                    let path: String = parse_value(args, i, "--log-dir")?;
                    config.log_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--relays" => {
                    let path: String = parse_value(args, i, "--relays")?;
                    config.relay_directory = Some(PathBuf::from(path));
                    i += 2;
                }
                "--max-jitter" => {
                    config.stats.max_jitter = parse_value(args, i, "--max-jitter")?;
                    i += 2;
                }
                "--max-loss" => {
                    config.stats.max_packet_loss = parse_value(args, i, "--max-loss")?;
                    i += 2;
                }
                "--no-datacenter-filter" => {
                    config.optimizer.datacenter_filter = false;
                    i += 1;
                }
                other => {
                    return Err(CoreError::Config(format!(
                        "Unknown argument: {}\nUsage: {} [--api-port <port>] [--interval-secs <n>] [--segments <n>] [--output <path>] [--log-dir <path>] [--relays <path>] [--max-jitter <ms>] [--max-loss <pct>] [--no-datacenter-filter]",
                        other,
                        args.first().map(String::as_str).unwrap_or("backend")
                    )));
                }
            }
        }

        // Env overrides
        if let Some(p) = std::env::var("RELAY_CORE_API_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            api_port = Some(p);
        }
        if let Some(n) = std::env::var("RELAY_CORE_SEGMENTS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            config.optimizer.segments = n;
        }
        if let Ok(path) = std::env::var("RELAY_CORE_OUTPUT") {
            config.output_path = Some(PathBuf::from(path));
        }

        if let Some(port) = api_port {
            config.api_addr = SocketAddr::from(([127, 0, 0, 1], port));
        }

        Ok(config)
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T> {
    let raw = args
        .get(i + 1)
        .ok_or_else(|| CoreError::Config(format!("{} requires a value", flag)))?;
    raw.parse::<T>()
        .map_err(|_| CoreError::Config(format!("{} has an invalid value: {}", flag, raw)))
}
