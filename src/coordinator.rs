// Copyright 2026 Percolator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Refresh coordinator: one acquisition-to-snapshot cycle, with retries.
//!
//! A cycle tries the cached subscription URL first; only when there is no
//! cache or the cached URL stops working does it launch a browser session.
//! Browser acquisition gets a fixed attempt budget with a flat backoff.
//! Both the scheduler and the manual-refresh endpoint call [`Coordinator::refresh`];
//! a single-flight gate keeps them from racing separate browser sessions,
//! with late callers adopting the in-flight result.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{RefreshError, RefreshResult};
use crate::fetch::SubscriptionClient;
use crate::model::UsageInfo;
use crate::normalize;
use crate::notify::Notifier;
use crate::portal::{self, chromium::ChromiumPage, PortalAcquisition};
use crate::store::CacheStore;
use crate::usage;

const MAX_ATTEMPTS: u32 = 5;
const RETRY_DELAY_MS: u64 = 2_000;

/// Where a refresh gets its subscription URL (and any dashboard usage) from.
///
/// The real implementation drives Chrome; tests script this instead.
#[async_trait]
pub trait LinkSource: Send + Sync {
    async fn acquire(&self, settings: &Settings) -> Result<PortalAcquisition>;
}

/// Launches a fresh Chrome for every acquisition and runs the portal
/// session protocol in it.
pub struct BrowserLinkSource;

#[async_trait]
impl LinkSource for BrowserLinkSource {
    async fn acquire(&self, settings: &Settings) -> Result<PortalAcquisition> {
        let page = ChromiumPage::launch(settings).await?;
        portal::acquire(Box::new(page), settings).await
    }
}

/// Single-flight bookkeeping. `completed` counts finished cycles; a caller
/// that observed an older count while waiting for the gate adopts `last`
/// instead of running its own cycle.
#[derive(Default)]
struct FlightState {
    completed: u64,
    last: Option<RefreshResult<String>>,
}

pub struct Coordinator {
    settings: Settings,
    store: CacheStore,
    client: SubscriptionClient,
    source: Arc<dyn LinkSource>,
    notifier: Arc<dyn Notifier>,
    flight: Mutex<FlightState>,
    /// Held for the whole cycle; serializes actual refresh work.
    run_gate: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        settings: Settings,
        store: CacheStore,
        source: Arc<dyn LinkSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            store,
            client: SubscriptionClient::new(),
            source,
            notifier,
            flight: Mutex::new(FlightState::default()),
            run_gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run one refresh cycle, or join the one already in flight.
    ///
    /// Returns the subscription URL the snapshot was refreshed from.
    pub async fn refresh(&self) -> RefreshResult<String> {
        let observed = self.flight.lock().await.completed;
        let _running = self.run_gate.lock().await;

        {
            let state = self.flight.lock().await;
            if state.completed > observed {
                if let Some(last) = &state.last {
                    debug!("adopting result of refresh finished while waiting");
                    return last.clone();
                }
            }
        }

        let outcome = self.run_cycle().await;

        let mut state = self.flight.lock().await;
        state.completed += 1;
        state.last = Some(outcome.clone());
        outcome
    }

    async fn run_cycle(&self) -> RefreshResult<String> {
        // cached URL first; the browser is only worth launching once the
        // last known link stops working
        if let Some(url) = self.store.latest_meta().url {
            info!("refreshing via cached subscription url");
            match self.try_url(&url, false).await {
                Ok(done) => return Ok(done),
                Err(e) => warn!("cached url failed, falling back to browser: {e}"),
            }
        }

        let mut last = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            info!("browser acquisition attempt {attempt}/{MAX_ATTEMPTS}");
            match self.attempt_via_browser().await {
                Ok(url) => return Ok(url),
                Err(e) => {
                    warn!("attempt {attempt} failed: {e}");
                    last = e.to_string();
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
        }
        Err(RefreshError::Exhausted {
            attempts: MAX_ATTEMPTS,
            last,
        })
    }

    /// One browser-backed attempt: acquire the URL, surface dashboard usage
    /// right away, then run the shared fetch-and-persist path.
    async fn attempt_via_browser(&self) -> RefreshResult<String> {
        let acquisition = self
            .source
            .acquire(&self.settings)
            .await
            .map_err(|e| RefreshError::Acquisition(format!("{e:#}")))?;

        let have_usage = match &acquisition.usage {
            Some(u) => {
                self.check_usage(u).await;
                true
            }
            None => false,
        };
        self.try_url(&acquisition.url, have_usage).await
    }

    /// Fetch, normalize, and persist from one subscription URL. Header-based
    /// usage is only consulted when the browser did not already surface any.
    async fn try_url(&self, url: &str, usage_already_checked: bool) -> RefreshResult<String> {
        let payload = self
            .client
            .fetch(url)
            .await
            .map_err(|e| RefreshError::Fetch(format!("{e:#}")))?;

        if !usage_already_checked {
            if let Some(u) = usage::from_headers(&payload.headers) {
                self.check_usage(&u).await;
            }
        }

        let normalized = normalize::normalize(&payload.body)
            .map_err(|e| RefreshError::Persistence(format!("{e:#}")))?;
        self.store
            .save(
                url,
                &normalized.text,
                &payload.headers,
                Some(payload.status),
                Some(payload.status_text.clone()),
            )
            .map_err(|e| RefreshError::Persistence(format!("{e:#}")))?;

        Ok(url.to_string())
    }

    /// Threshold check plus alert delivery. Delivery failures are logged and
    /// swallowed; an alert must never fail a refresh.
    async fn check_usage(&self, usage: &UsageInfo) {
        let threshold = self.settings.usage_threshold;
        if !usage::threshold_exceeded(usage, threshold) {
            debug!("usage below threshold: {}", usage::describe(usage));
            return;
        }

        warn!("usage over threshold: {}", usage::describe(usage));
        let subject = format!(
            "[percolator] subscription usage at {:.1}%",
            usage.ratio() * 100.0
        );
        let body = format!(
            "Subscription traffic is at {}, over the configured threshold of {:.0}%.\n\
             Used: {}\nTotal: {}\n",
            usage::describe(usage),
            threshold * 100.0,
            usage::format_bytes(usage.used),
            usage::format_bytes(usage.total),
        );
        if let Err(e) = self.notifier.notify(&subject, &body).await {
            warn!("usage alert delivery failed: {e:#}");
        }
    }
}
