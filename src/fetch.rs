//! Subscription payload download.
//!
//! One plain GET with a Clash user agent. Upstreams vary the payload shape
//! by client UA, and `Clash` unlocks the YAML form where the provider
//! supports it; raw share-link bundles come back for the rest.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::redirect::Policy;

const FETCH_TIMEOUT_MS: u64 = 30_000;
const MAX_REDIRECTS: usize = 5;
const FETCH_UA: &str = "Clash";
const FETCH_ACCEPT: &str = "text/yaml,text/plain;q=0.9,*/*;q=0.8";

/// What came back from the subscription endpoint.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    /// URL as requested.
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub status_text: String,
    /// Response headers, keys lowercased. Duplicate keys keep the last value.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Shared HTTP client for subscription fetches.
#[derive(Debug, Clone)]
pub struct SubscriptionClient {
    client: reqwest::Client,
}

impl SubscriptionClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(FETCH_TIMEOUT_MS))
            .redirect(Policy::limited(MAX_REDIRECTS))
            .user_agent(FETCH_UA)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Download the payload. Non-2xx responses are errors; the caller's
    /// retry ladder decides what happens next.
    pub async fn fetch(&self, url: &str) -> Result<FetchedPayload> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, FETCH_ACCEPT)
            .send()
            .await
            .with_context(|| format!("subscription request to {url} failed"))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect();

        if !status.is_success() {
            bail!("subscription endpoint returned {status}");
        }

        let body = response
            .text()
            .await
            .context("failed to read subscription body")?;

        Ok(FetchedPayload {
            url: url.to_string(),
            final_url,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}
