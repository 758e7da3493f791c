//! Standalone background worker: polling, queue drains, learning passes.
//! Use alongside an API-only `jobmail-server` (RUN_SCHEDULER=0).

use anyhow::Context;
use log::LevelFilter;
use tokio::signal;
use tokio::sync::watch;

use jobmail::config::Config;
use jobmail::db::Metastore;
use jobmail::scheduler::Scheduler;
use jobmail::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let store = Metastore::open(&config.database_path)
        .with_context(|| format!("opening database at {}", config.database_path.display()))?;
    let state = AppState::new(config, store);
    log::info!("jobmail-worker started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Scheduler::new(state, shutdown_rx).run());

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    log::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Wait for loops to stop and in-flight reservations to be released.
    handle.await.context("scheduler task panicked")?;
    Ok(())
}
