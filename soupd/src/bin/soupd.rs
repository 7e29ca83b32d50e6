//! Standalone supervisor: runs one worker until Ctrl-C or SIGTERM.
//!
//! Usage: `soupd <worker-id> <min-port> <max-port>`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};

use soupd::{InMemoryWorkerRegistry, NoSessions, PortRange, Registries, SupervisorConfig, Worker};

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn parse_args(args: &[String]) -> anyhow::Result<(String, PortRange)> {
    let [worker_id, min, max] = args else {
        bail!("usage: soupd <worker-id> <min-port> <max-port>");
    };
    let min: u16 = min.parse().with_context(|| format!("invalid min port {min:?}"))?;
    let max: u16 = max.parse().with_context(|| format!("invalid max port {max:?}"))?;
    Ok((worker_id.clone(), PortRange::new(min, max)?))
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
    let terminate = terminate.recv();

    tokio::select! {
        result = ctrl_c => {
            result.context("failed to install Ctrl+C handler")?;
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    soupd::logging::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (worker_id, ports) = parse_args(&args)?;

    let config = Arc::new(SupervisorConfig::from_env());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = config.protocol_version,
        worker_path = %config.worker_path.display(),
        "Starting soupd"
    );

    let workers = Arc::new(InMemoryWorkerRegistry::new());
    let registries = Registries::new(Arc::new(NoSessions), workers.clone());
    let worker = Worker::start(config, registries, worker_id, ports);

    tokio::select! {
        result = shutdown_signal() => result?,
        _ = worker.terminated() => {
            tracing::warn!(worker_id = %worker.id(), "Worker terminated on its own");
            return Ok(());
        }
    }

    worker.close();
    if tokio::time::timeout(TEARDOWN_TIMEOUT, worker.terminated())
        .await
        .is_err()
    {
        tracing::warn!(worker_id = %worker.id(), "Worker did not shut down in time");
    }
    tracing::info!(registered = workers.len(), "soupd stopped");
    Ok(())
}
