//! Configuration settings for SCAMP
//!
//! Defines CLI arguments, runtime configuration structs and their
//! defaults for the local engine, coordinator, worker and client.

use super::options::{ComputeOptions, ProfileType};
use crate::core::{Precision, DEFAULT_K, DEFAULT_MAX_TILE_SIZE};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default coordinator port
pub const DEFAULT_PORT: u16 = 30078;

/// Default work range edge, in subsequences
pub const DEFAULT_RANGE_SIZE: usize = 131_072;

/// SCAMP - tiled matrix profile computation
#[derive(Parser, Debug, Clone)]
#[command(name = "scamp")]
#[command(author = "SCAMP Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tiled matrix profile computation with distributed job coordination")]
#[command(long_about = r#"
SCAMP computes matrix profiles of one or two time series.

Profile types:
  - nn      nearest neighbor per subsequence
  - knn     k nearest neighbors per subsequence
  - sum     sum of correlations above a threshold
  - matrix  pooled summary of the whole correlation matrix

Examples:
  scamp compute series.txt --window 100                   # Self-join
  scamp compute a.txt b.txt -m 50 --kind knn -k 5         # AB-join, 5 neighbors
  scamp server --port 30078                               # Start a coordinator
  scamp worker --coordinator head:30078                   # Start a worker
  scamp submit series.txt -m 100 --coordinator head:30078 # Distributed job
"#)]
pub struct CliArgs {
    /// Verbose logging (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Compute a matrix profile locally
    #[command(name = "compute")]
    Compute {
        /// Job options
        #[command(flatten)]
        job: JobArgs,

        /// Output options
        #[command(flatten)]
        output: OutputArgs,
    },

    /// Run a job coordinator
    #[command(name = "server")]
    Server {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Work range edge, in subsequences
        #[arg(long, default_value_t = DEFAULT_RANGE_SIZE, value_name = "NUM")]
        range_size: usize,

        /// Reclaim assigned work ranges not reported within this time
        #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
        liveness_timeout: Duration,

        /// Attempts per work range before the job fails
        #[arg(long, default_value = "3", value_name = "NUM")]
        max_attempts: usize,

        /// Keep fetched results this long before purging them
        #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
        retention: Duration,
    },

    /// Run a worker against a coordinator
    #[command(name = "worker")]
    Worker {
        /// Coordinator address (host:port)
        #[arg(short, long, default_value = "localhost:30078")]
        coordinator: String,

        /// Worker id reported to the coordinator (default: hostname-pid)
        #[arg(long)]
        worker_id: Option<String>,

        /// CPU worker group size (0 = default resource selection)
        #[arg(short = 't', long, default_value = "0", value_name = "NUM")]
        threads: usize,

        /// Wait this long when no work is available
        #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
        idle_backoff: Duration,
    },

    /// Run a job through a coordinator and wait for the result
    #[command(name = "submit")]
    Submit {
        /// Coordinator address (host:port)
        #[arg(short, long, default_value = "localhost:30078")]
        coordinator: String,

        /// Status poll interval
        #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
        poll_interval: Duration,

        /// Job options
        #[command(flatten)]
        job: JobArgs,

        /// Output options
        #[command(flatten)]
        output: OutputArgs,
    },

    /// List jobs known to a coordinator
    #[command(name = "jobs")]
    Jobs {
        /// Coordinator address (host:port)
        #[arg(short, long, default_value = "localhost:30078")]
        coordinator: String,
    },
}

/// Job description shared by `compute` and `submit`
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Series A file (whitespace or comma separated numbers)
    #[arg(value_name = "SERIES_A")]
    pub series_a: PathBuf,

    /// Series B file for an AB-join
    #[arg(value_name = "SERIES_B")]
    pub series_b: Option<PathBuf>,

    /// Subsequence length
    #[arg(short = 'm', long, value_name = "NUM")]
    pub window: usize,

    /// Profile type
    #[arg(long, value_enum, default_value = "nn")]
    pub kind: ProfileType,

    /// Neighbors per subsequence for knn
    #[arg(short = 'k', default_value_t = DEFAULT_K, value_name = "NUM")]
    pub k: usize,

    /// Correlation threshold for sum and knn
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    pub threshold: f64,

    /// Kernel precision
    #[arg(long, value_enum, default_value = "double")]
    pub precision: Precision,

    /// Report Pearson correlations instead of Euclidean distances
    #[arg(long)]
    pub pearson: bool,

    /// GPU device ids (comma separated)
    #[arg(long, value_delimiter = ',', value_name = "IDS")]
    pub gpus: Vec<i32>,

    /// CPU worker group size (0 = default resource selection)
    #[arg(short = 't', long, default_value = "0", value_name = "NUM")]
    pub threads: usize,

    /// Maximum tile edge, in subsequences
    #[arg(long, default_value_t = DEFAULT_MAX_TILE_SIZE, value_name = "NUM")]
    pub max_tile_size: usize,

    /// Pooled summary rows
    #[arg(long, default_value = "50", value_name = "NUM")]
    pub mheight: usize,

    /// Pooled summary columns
    #[arg(long, default_value = "50", value_name = "NUM")]
    pub mwidth: usize,

    /// Keep row and column profiles separate for self-joins
    #[arg(long)]
    pub keep_rows_separate: bool,

    /// Series share a time axis; apply the exclusion zone to AB-joins
    #[arg(long)]
    pub aligned: bool,

    /// Show progress
    #[arg(long)]
    pub progress: bool,
}

impl JobArgs {
    /// Compute options described by these arguments
    pub fn options(&self) -> ComputeOptions {
        ComputeOptions {
            threshold: self.threshold,
            silent: !self.progress,
            mheight: self.mheight,
            mwidth: self.mwidth,
            k: self.k,
            precision: self.precision,
            pearson: self.pearson,
            gpus: self.gpus.clone(),
            threads: self.threads,
            max_tile_size: self.max_tile_size,
            keep_rows_separate: self.keep_rows_separate,
            aligned: self.aligned,
        }
    }
}

/// Where and how results are written
#[derive(Args, Debug, Clone)]
pub struct OutputArgs {
    /// Output file (default: stdout)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub output_format: OutputFormat,
}

/// Result output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    /// One value per line
    #[default]
    Text,
    /// JSON document
    Json,
}

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable
    #[default]
    Text,
    /// Structured JSON lines
    Json,
}

/// Local engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries per tile before the computation fails
    pub tile_retry_budget: usize,
    /// Device ids to run on
    pub gpus: Vec<i32>,
    /// CPU worker group size (0 = default resource selection)
    pub threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tile_retry_budget: 3,
            gpus: Vec::new(),
            threads: 0,
        }
    }
}

impl EngineConfig {
    /// Engine configuration for a set of compute options
    pub fn from_options(options: &ComputeOptions) -> Self {
        Self {
            gpus: options.gpus.clone(),
            threads: options.threads,
            ..Default::default()
        }
    }
}

/// Job coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address
    pub bind: String,
    /// Listen port
    pub port: u16,
    /// Work range edge, in subsequences
    pub range_size: usize,
    /// Assigned ranges not reported within this time are reclaimed
    pub liveness_timeout: Duration,
    /// Attempts per work range before the job fails
    pub max_range_attempts: usize,
    /// Fetched jobs are purged after this long
    pub retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            range_size: DEFAULT_RANGE_SIZE,
            liveness_timeout: Duration::from_secs(300),
            max_range_attempts: 3,
            retention: Duration::from_secs(3600),
        }
    }
}

impl CoordinatorConfig {
    /// Socket address to bind
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Job client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Status poll interval
    pub poll_interval: Duration,
    /// Connection timeout for remote services
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Id reported to the coordinator
    pub worker_id: String,
    /// Wait this long when no work is available
    pub idle_backoff: Duration,
    /// Local engine settings
    pub engine: EngineConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            idle_backoff: Duration::from_secs(2),
            engine: EngineConfig::default(),
        }
    }
}

/// `hostname-pid`
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_compute_parsing() {
        let args = CliArgs::try_parse_from([
            "scamp", "compute", "a.txt", "b.txt", "-m", "32", "--kind", "knn", "-k", "3",
            "--threshold", "-0.5", "--gpus", "0,1", "--precision", "mixed", "-vv",
        ])
        .unwrap();

        assert_eq!(args.verbose, 2);
        match args.command {
            Commands::Compute { job, output } => {
                assert_eq!(job.window, 32);
                assert_eq!(job.series_b, Some(PathBuf::from("b.txt")));
                assert_eq!(job.kind, ProfileType::KNearest);
                assert_eq!(job.gpus, vec![0, 1]);
                let options = job.options();
                assert_eq!(options.k, 3);
                assert_eq!(options.threshold, -0.5);
                assert_eq!(options.precision, Precision::Mixed);
                assert!(options.silent);
                assert_eq!(output.output_format, OutputFormat::Text);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_server_durations() {
        let args = CliArgs::try_parse_from([
            "scamp", "server", "--liveness-timeout", "90s", "--retention", "2h",
        ])
        .unwrap();

        match args.command {
            Commands::Server {
                port,
                liveness_timeout,
                retention,
                ..
            } => {
                assert_eq!(port, DEFAULT_PORT);
                assert_eq!(liveness_timeout, Duration::from_secs(90));
                assert_eq!(retention, Duration::from_secs(7200));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.address(), "0.0.0.0:30078");
        assert_eq!(config.range_size % 64, 0);

        assert_eq!(ClientConfig::default().poll_interval, Duration::from_secs(2));
        assert!(WorkerConfig::default().worker_id.contains('-'));
    }
}
