//! Show the current snapshot state.

use anyhow::Result;

use crate::config::Settings;
use crate::store::CacheStore;

pub async fn run() -> Result<()> {
    let settings = Settings::from_env();
    let store = CacheStore::new(settings.data_dir.clone());
    let meta = store.latest_meta();

    println!("Percolator Status");
    println!("=================");
    println!();
    println!("Data dir:   {}", settings.data_dir.display());
    match &meta.url {
        Some(url) => println!("Source URL: {url}"),
        None => println!("Source URL: (no snapshot yet)"),
    }
    match &meta.fetched_at {
        Some(at) => println!("Fetched at: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Fetched at: never"),
    }
    println!(
        "Snapshot:   {} proxies, {} groups, {} rules",
        meta.counts.proxies, meta.counts.groups, meta.counts.rules
    );
    if let Some(status) = meta.status {
        println!(
            "Upstream:   {} {}",
            status,
            meta.status_text.as_deref().unwrap_or("")
        );
    }

    let nodes = store.latest_nodes();
    if !nodes.is_empty() {
        println!();
        println!("Nodes:");
        for node in nodes.iter().take(20) {
            println!("  {} ({}:{})", node.name, node.server, node.port);
        }
        if nodes.len() > 20 {
            println!("  ... and {} more", nodes.len() - 20);
        }
    }
    Ok(())
}
