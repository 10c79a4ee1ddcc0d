//! One manual refresh cycle from the command line.

use anyhow::Result;

use crate::cli;
use crate::config::Settings;

pub async fn run() -> Result<()> {
    cli::init_tracing();
    let settings = Settings::from_env();
    let coordinator = cli::build_coordinator(settings);

    let url = coordinator.refresh().await?;
    let meta = coordinator.store().latest_meta();
    println!("refreshed from {url}");
    println!(
        "snapshot: {} proxies, {} groups, {} rules",
        meta.counts.proxies, meta.counts.groups, meta.counts.rules
    );
    Ok(())
}
