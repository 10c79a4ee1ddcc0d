//! Shared data types: the canonical Clash document, proxy nodes, snapshot
//! metadata, and bandwidth usage.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Canonical Clash-shaped configuration document.
///
/// Only the three core arrays are typed; every other top-level key an
/// upstream document carries is preserved verbatim in `extra`. The flattened
/// map is declared first so upstream keys keep their position ahead of the
/// core arrays when the document is re-serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClashConfig {
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,

    #[serde(default)]
    pub proxies: Vec<Value>,

    #[serde(rename = "proxy-groups", default)]
    pub proxy_groups: Vec<Value>,

    #[serde(default)]
    pub rules: Vec<String>,
}

impl ClashConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("failed to parse Clash YAML document")
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize Clash YAML document")
    }

    /// Names of all proxies, in document order. Entries without a string
    /// `name` are skipped.
    pub fn proxy_names(&self) -> Vec<String> {
        self.proxies
            .iter()
            .filter_map(|p| {
                p.as_mapping()
                    .and_then(|m| m.get(Value::from("name")))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect()
    }
}

fn default_udp() -> bool {
    false
}

/// A single Shadowsocks proxy node in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyNode {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub server: String,
    pub port: u16,
    pub cipher: String,
    pub password: String,
    #[serde(default = "default_udp")]
    pub udp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
}

/// Element counts of the canonical document, recorded in the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocCounts {
    pub proxies: usize,
    pub groups: usize,
    pub rules: usize,
}

/// Snapshot metadata persisted alongside the canonical document.
///
/// Field names follow the on-disk `meta.json` layout, which predates this
/// crate and is consumed by external dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionMeta {
    pub url: Option<String>,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub counts: DocCounts,
    /// Upstream response headers, keys lowercased.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(
        rename = "statusText",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub status_text: Option<String>,
}

/// Bandwidth usage in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub used: u64,
    pub total: u64,
}

impl UsageInfo {
    /// Used fraction of the plan; zero when the total is unknown.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clash_config_preserves_extra_keys() {
        let doc = "port: 7890\nmode: rule\nproxies: []\nproxy-groups: []\nrules: []\n";
        let config = ClashConfig::from_yaml_str(doc).unwrap();
        assert_eq!(
            config.extra.get("port").and_then(Value::as_u64),
            Some(7890)
        );
        let out = config.to_yaml_string().unwrap();
        assert!(out.contains("port: 7890"));
        assert!(out.contains("mode: rule"));
    }

    #[test]
    fn proxy_names_skips_nameless_entries() {
        let doc = r#"
proxies:
  - { name: a, type: ss, server: h, port: 1, cipher: c, password: p }
  - { type: ss, server: h2, port: 2, cipher: c, password: p }
  - { name: b, type: ss, server: h3, port: 3, cipher: c, password: p }
"#;
        let config = ClashConfig::from_yaml_str(doc).unwrap();
        assert_eq!(config.proxy_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn meta_roundtrip_uses_legacy_field_names() {
        let meta = SubscriptionMeta {
            url: Some("https://example.com/sub".into()),
            fetched_at: Some(Utc::now()),
            counts: DocCounts { proxies: 3, groups: 4, rules: 9 },
            headers: BTreeMap::new(),
            status: Some(200),
            status_text: Some("OK".into()),
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"fetchedAt\""));
        assert!(json.contains("\"statusText\""));
        let back: SubscriptionMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn usage_ratio_handles_zero_total() {
        let usage = UsageInfo { used: 10, total: 0 };
        assert_eq!(usage.ratio(), 0.0);
        let usage = UsageInfo { used: 250, total: 1000 };
        assert!((usage.ratio() - 0.25).abs() < f64::EPSILON);
    }
}
