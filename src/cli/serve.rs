//! Run the percolator daemon: HTTP surface plus the scheduled refresher.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::cli;
use crate::config::Settings;
use crate::scheduler;
use crate::server;

pub async fn run() -> Result<()> {
    cli::init_tracing();
    let settings = Settings::from_env();
    info!("starting percolator v{}", env!("CARGO_PKG_VERSION"));

    let coordinator = cli::build_coordinator(settings);
    let shutdown = Arc::new(Notify::new());

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        signal_shutdown.notify_waiters();
    });

    if coordinator.settings().init_refresh {
        let init = coordinator.clone();
        tokio::spawn(async move {
            info!("startup refresh requested");
            if let Err(e) = init.refresh().await {
                warn!("startup refresh failed: {e}");
            }
        });
    }

    let scheduler_handle = if coordinator.settings().cron_enabled {
        Some(scheduler::spawn(coordinator.clone(), shutdown.clone()))
    } else {
        info!("scheduled refresh disabled");
        None
    };

    server::start(coordinator, shutdown).await?;

    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }
    info!("percolator stopped");
    Ok(())
}
