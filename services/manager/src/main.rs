//! Axle service manager daemon.
//!
//! Wraps the engine with configuration loading, logging, and signal
//! handling. Exits non-zero only on unrecoverable initialization errors;
//! a signal-driven shutdown exits zero.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use axle_service_manager::config::Config;
use axle_service_manager::devices::DeviceBroker;
use axle_service_manager::engine::ServiceManager;
use axle_service_manager::model::UNIT_PREFIX;
use axle_service_manager::state::SqliteStore;
use axle_service_manager::supervisor::{SystemdSupervisor, UnitSupervisor};

#[derive(Debug, Parser)]
#[command(name = "axle-managerd", about = "Axle per-node service manager")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate configuration and device declarations, then exit.
    #[arg(long)]
    check: bool,

    /// Stop and remove every managed unit and delete local state.
    #[arg(long)]
    cleanup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        working_dir = %config.working_dir.display(),
        "starting axle service manager"
    );

    if cli.cleanup {
        return cleanup(&config).await;
    }

    let broker = Arc::new(
        DeviceBroker::load(&config.resources_file)
            .context("loading device resource declarations")?,
    );

    if cli.check {
        broker.validate().context("device declarations invalid")?;
        info!("configuration and device declarations are valid");
        return Ok(());
    }

    let storage = Arc::new(SqliteStore::open(&config.state_db).context("opening state store")?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let supervisor = Arc::new(SystemdSupervisor::new(
        Duration::from_millis(500),
        shutdown_rx,
    ));

    let manager = ServiceManager::new(config, storage, supervisor, broker)
        .await
        .context("initializing service manager")?;

    // TODO: wire the cloud transport once the broker client lands; until
    // then the inbound API is exercised by the integration harness.

    wait_for_signal().await;

    let _ = shutdown_tx.send(true);
    manager.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to wait for ctrl-c");
            } else {
                info!("received SIGINT");
            }
        }
    }
}

/// One-shot recovery path: removes every unit bearing our prefix and
/// deletes local state.
async fn cleanup(config: &Config) -> Result<()> {
    info!("cleaning up managed units and state");

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let supervisor = SystemdSupervisor::new(Duration::from_millis(500), shutdown_rx);

    let units = supervisor
        .list_units(UNIT_PREFIX)
        .await
        .context("listing managed units")?;

    for unit in units {
        info!(unit = %unit, "removing unit");
        if let Err(e) = supervisor.stop(&unit).await {
            error!(unit = %unit, error = %e, "failed to stop unit");
        }
        if let Err(e) = supervisor.remove(&unit).await {
            error!(unit = %unit, error = %e, "failed to remove unit");
        }
    }

    let instances_dir = config.instances_dir();
    if instances_dir.exists() {
        std::fs::remove_dir_all(&instances_dir).context("removing instances dir")?;
    }
    if config.state_db.exists() {
        std::fs::remove_file(&config.state_db).context("removing state database")?;
    }

    Ok(())
}
