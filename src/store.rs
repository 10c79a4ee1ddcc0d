//! Durable snapshot storage.
//!
//! A refresh persists three artifacts side by side: `latest.yml` (the
//! canonical document), `meta.json` (where it came from and what it holds),
//! and `nodes.json` (the typed node list). Reads never fail: a missing or
//! unreadable snapshot falls back to the bundled sample document and empty
//! metadata, so the HTTP surface always has something to serve.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use md5::{Digest, Md5};
use tracing::{info, warn};

use crate::model::{ClashConfig, DocCounts, ProxyNode, SubscriptionMeta};
use crate::normalize;

const LATEST_FILE: &str = "latest.yml";
const META_FILE: &str = "meta.json";
const NODES_FILE: &str = "nodes.json";

const SAMPLE_DOC: &str = include_str!("assets/sample.yml");

/// Filesystem-backed snapshot store rooted at one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a refreshed snapshot.
    ///
    /// The canonical text is re-parsed here to derive counts and the node
    /// list; if that parse fails the text is still persisted, counts go to
    /// zero, and any previous `nodes.json` is left in place.
    pub fn save(
        &self,
        url: &str,
        canonical_text: &str,
        headers: &BTreeMap<String, String>,
        status: Option<u16>,
        status_text: Option<String>,
    ) -> Result<SubscriptionMeta> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create data dir {}", self.dir.display()))?;

        let (counts, nodes) = match ClashConfig::from_yaml_str(canonical_text) {
            Ok(config) => {
                let counts = DocCounts {
                    proxies: config.proxies.len(),
                    groups: config.proxy_groups.len(),
                    rules: config.rules.len(),
                };
                (counts, Some(normalize::nodes_from_config(&config)))
            }
            Err(e) => {
                warn!("canonical text failed recount parse: {e:#}");
                (DocCounts::default(), None)
            }
        };

        let latest_path = self.dir.join(LATEST_FILE);
        fs::write(&latest_path, canonical_text)
            .with_context(|| format!("failed to write {}", latest_path.display()))?;

        let meta = SubscriptionMeta {
            url: Some(url.to_string()),
            fetched_at: Some(Utc::now()),
            counts,
            headers: headers.clone(),
            status,
            status_text,
        };
        let meta_path = self.dir.join(META_FILE);
        let meta_json = serde_json::to_vec_pretty(&meta).context("failed to encode meta")?;
        fs::write(&meta_path, meta_json)
            .with_context(|| format!("failed to write {}", meta_path.display()))?;

        if let Some(nodes) = nodes {
            let nodes_path = self.dir.join(NODES_FILE);
            let nodes_json = serde_json::to_vec_pretty(&nodes).context("failed to encode nodes")?;
            fs::write(&nodes_path, nodes_json)
                .with_context(|| format!("failed to write {}", nodes_path.display()))?;
        }

        info!(
            "snapshot saved: {} proxies, {} groups, {} rules",
            counts.proxies, counts.groups, counts.rules
        );
        Ok(meta)
    }

    /// The latest canonical document, or the bundled sample when no snapshot
    /// exists yet.
    pub fn latest_text(&self) -> String {
        match fs::read_to_string(self.dir.join(LATEST_FILE)) {
            Ok(text) => text,
            Err(_) => SAMPLE_DOC.to_string(),
        }
    }

    /// The latest snapshot metadata; defaults when absent or unreadable.
    pub fn latest_meta(&self) -> SubscriptionMeta {
        let path = self.dir.join(META_FILE);
        let Ok(raw) = fs::read(&path) else {
            return SubscriptionMeta::default();
        };
        match serde_json::from_slice(&raw) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("unreadable {}: {e}", path.display());
                SubscriptionMeta::default()
            }
        }
    }

    /// The latest typed node list; empty when absent or unreadable.
    pub fn latest_nodes(&self) -> Vec<ProxyNode> {
        let path = self.dir.join(NODES_FILE);
        let Ok(raw) = fs::read(&path) else {
            return Vec::new();
        };
        match serde_json::from_slice(&raw) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("unreadable {}: {e}", path.display());
                Vec::new()
            }
        }
    }

    /// The sample document served before the first successful refresh.
    pub fn sample() -> &'static str {
        SAMPLE_DOC
    }

    /// Lowercase-hex MD5 of a document, used as the HTTP ETag.
    pub fn etag(content: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
