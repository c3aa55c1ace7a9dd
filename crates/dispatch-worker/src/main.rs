#![doc = include_str!("../README.md")]

mod config;
mod discovery;
mod processor;
mod telemetry;

use clap::Parser;
use config::{CliArgs, WorkerConfig};
use discovery::StaticDiscovery;
use dispatch_worker_core::{LazyChannelConnector, WorkerPoolManager};
use processor::HealthWatchProcessor;
use std::sync::Arc;
use telemetry::init_telemetry;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = WorkerConfig::try_from(args)?;

    let providers = init_telemetry(config.log_format)?;
    log_startup_info(&config);

    let connector = LazyChannelConnector::new()
        .connect_timeout(config.connect_timeout)
        .tcp_keepalive(config.keepalive_interval)
        .http2_keepalive_interval(config.keepalive_interval);
    let processor = HealthWatchProcessor::new(config.health_service.clone())
        .check_timeout(config.pool.notify_shutdown_timeout);

    let pool = Arc::new(WorkerPoolManager::new(
        config.pool.clone(),
        connector,
        Arc::new(processor),
    ));
    telemetry::observe_live_workers(&pool);

    pool.start()?;

    let mut discovery = StaticDiscovery::new();
    let rejected = discovery.update(&pool, config.targets.iter().cloned())?;
    if discovery.targets().next().is_none() {
        providers.shutdown();
        anyhow::bail!("None of the {rejected} configured target(s) could be used");
    }

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Serving {} target(s) with {} worker(s)",
        pool.targets().len(),
        pool.live_concurrency()
    );

    shutdown_signal().await;

    let stopped = pool.stop().await;
    if let Err(_e) = &stopped {
        #[cfg(feature = "tracing")]
        tracing::error!("Error during pool shutdown: {_e}");
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shut down successfully");
    }

    providers.shutdown();
    stopped.map_err(Into::into)
}

fn log_startup_info(_config: &WorkerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting dispatch worker with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting dispatch worker for {} target(s) (parallelism={}, match_global_cap={}, global_cap={})",
            _config.targets.len(),
            _config.pool.parallelism,
            _config.pool.match_global_cap,
            _config.pool.global_cap
        );
    }
}

/// Resolves on Ctrl+C or SIGTERM. If a handler cannot be installed, that
/// signal is simply never observed.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to install SIGTERM handler: {_e}");
                core::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = core::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to install Ctrl+C handler: {_e}");
            core::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, stopping workers...");
}
