//! HTTP API server. Runs the router plus the background scheduler in one
//! process; for split deployments run `jobmail-worker` separately and keep
//! this process API-only via `RUN_SCHEDULER=0`.

use std::sync::Arc;

use anyhow::Context;
use log::LevelFilter;
use tokio::signal;
use tokio::sync::watch;

use jobmail::config::Config;
use jobmail::db::Metastore;
use jobmail::http::create_router;
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

    let bind = format!("{}:{}", config.server_host, config.server_port);
    let run_scheduler = std::env::var("RUN_SCHEDULER")
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(true);

    let state: Arc<AppState> = AppState::new(config, store);
    log::info!("jobmail-server listening on {bind}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = if run_scheduler {
        let scheduler = Scheduler::new(state.clone(), shutdown_rx);
        Some(tokio::spawn(scheduler.run()))
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let app = create_router(state);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("server error")?;
        }
        _ = signal::ctrl_c() => {
            log::info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }
    Ok(())
}
