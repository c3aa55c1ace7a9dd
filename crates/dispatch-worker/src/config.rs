use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use crate::telemetry::LogFormat;
use dispatch_worker_core::Config;

/// Runtime configuration for the `dispatch-worker` binary.
///
/// Controls how many workers run against each dispatch target and how long
/// the process waits for them on shutdown. All values are parsed from CLI
/// arguments or environment variables (a `.env` file is honored).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "dispatch-worker",
    version,
    about = "Runs rebalanced gRPC worker pools against a set of dispatch targets"
)]
pub struct CliArgs {
    /// Number of workers per target when the global cap is not matched.
    ///
    /// Values below one are treated as one.
    ///
    /// Environment variable: `PARALLELISM`
    #[arg(long, env = "PARALLELISM", default_value_t = 10)]
    pub parallelism: usize,

    /// Spread `--global-cap` workers across all targets instead of running
    /// `--parallelism` workers on each.
    ///
    /// Environment variable: `MATCH_GLOBAL_CAP`
    #[arg(long, env = "MATCH_GLOBAL_CAP", default_value_t = false)]
    pub match_global_cap: bool,

    /// Total number of workers across all targets when `--match-global-cap`
    /// is set. Every target still gets at least one worker.
    ///
    /// Environment variable: `GLOBAL_CAP`
    #[arg(long, env = "GLOBAL_CAP", default_value_t = 0)]
    pub global_cap: usize,

    /// Dispatch target addresses (`host:port` or a full URI).
    ///
    /// Repeat the flag or pass a comma separated list.
    ///
    /// Environment variable: `TARGETS`
    #[arg(long = "target", env = "TARGETS", value_delimiter = ',')]
    pub targets: Vec<String>,

    /// Health service name to watch on each target. Empty means the whole
    /// server.
    ///
    /// Environment variable: `HEALTH_SERVICE`
    #[arg(long, env = "HEALTH_SERVICE", default_value_t = String::new())]
    pub health_service: String,

    /// Timeout for establishing a connection to a target, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// TCP and HTTP/2 keepalive interval towards targets, in seconds.
    #[arg(long, default_value_t = 10)]
    pub keepalive_interval_secs: u64,

    /// How long to wait for all workers to exit on shutdown, in seconds.
    #[arg(long, default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// How long each worker may spend notifying its target on exit, in
    /// seconds.
    #[arg(long, default_value_t = 5)]
    pub notify_shutdown_timeout_secs: u64,

    /// Console log format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool: Config,
    pub targets: Vec<String>,
    pub health_service: String,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub log_format: LogFormat,
}

impl TryFrom<CliArgs> for WorkerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let mut targets: Vec<String> = Vec::with_capacity(args.targets.len());
        for target in args.targets {
            let target = target.trim();
            if !target.is_empty() && !targets.iter().any(|t| t == target) {
                targets.push(target.to_owned());
            }
        }

        if targets.is_empty() {
            bail!("At least one target is required (--target or TARGETS)");
        }

        if args.match_global_cap && args.global_cap == 0 {
            bail!("GLOBAL_CAP must be greater than 0 when MATCH_GLOBAL_CAP is set");
        }

        if args.connect_timeout_ms == 0 {
            bail!("--connect-timeout-ms must be greater than 0");
        }
        if args.keepalive_interval_secs == 0 {
            bail!("--keepalive-interval-secs must be greater than 0");
        }
        if args.shutdown_timeout_secs == 0 {
            bail!("--shutdown-timeout-secs must be greater than 0");
        }
        if args.notify_shutdown_timeout_secs == 0 {
            bail!("--notify-shutdown-timeout-secs must be greater than 0");
        }

        let pool = Config {
            parallelism: args.parallelism,
            match_global_cap: args.match_global_cap,
            global_cap: args.global_cap,
            ..Config::default()
        }
        .shutdown_timeout(Duration::from_secs(args.shutdown_timeout_secs))
        .notify_shutdown_timeout(Duration::from_secs(args.notify_shutdown_timeout_secs));

        Ok(Self {
            pool,
            targets,
            health_service: args.health_service,
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            keepalive_interval: Duration::from_secs(args.keepalive_interval_secs),
            log_format: args.log_format,
        })
    }
}
