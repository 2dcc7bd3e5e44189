//! prime-cache server binary.
//!
//! Runs the TCP server by default. With `--worker` the same binary acts as a
//! single-task worker process: one task on stdin, one reply on stdout.

use prime_cache::config::Config;
use prime_cache::{worker, Backend, Orchestrator, Server};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout is reserved for worker replies
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if config.worker_mode {
        return run_worker();
    }

    info!(
        host = %config.host,
        port = config.port,
        cache = ?config.cache_backend,
        max_workers = config.max_workers,
        worker_timeout_ms = ?config.worker_timeout_ms,
        "Starting prime-cache server"
    );

    // One cooperative event loop; CPU work goes to worker processes
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))
}

fn run_worker() -> Result<(), Box<dyn std::error::Error>> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    worker::run_worker(stdin.lock(), stdout.lock())?;
    Ok(())
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let cache = Backend::from_config(&config).await?;
    let dispatcher = config.dispatcher()?;
    let orchestrator =
        Arc::new(Orchestrator::new(cache, dispatcher).with_store_policy(config.store_policy()));

    let server = Server::bind(&config.listen_addr(), orchestrator).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
