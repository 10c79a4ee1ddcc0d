//! CDP-backed portal page using chromiumoxide.
//!
//! One launched browser per session; the session owns the whole lifecycle
//! and tears the browser down in [`PortalPage::close`]. Element lookups that
//! miss — and interactions that fail on an element that did match — read as
//! absence so the caller's fallback chains keep moving.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tracing::debug;

use super::PortalPage;
use crate::config::Settings;

const NAV_TIMEOUT_MS: u64 = 30_000;

/// Desktop UA; the portal serves a degraded page to obvious automation.
const PORTAL_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0 Safari/537.36";

/// Find the Chrome/Chromium binary.
pub fn find_chrome() -> Option<PathBuf> {
    // 1. PERC_CHROME env
    if let Ok(p) = std::env::var("PERC_CHROME") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. System PATH
    if let Ok(path) = which::which("google-chrome") {
        return Some(path);
    }
    if let Ok(path) = which::which("chromium") {
        return Some(path);
    }
    if let Ok(path) = which::which("chromium-browser") {
        return Some(path);
    }

    // 3. Common macOS location
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// A real browser page driving the portal.
pub struct ChromiumPage {
    browser: Browser,
    page: Page,
}

impl ChromiumPage {
    pub async fn launch(settings: &Settings) -> Result<Self> {
        let chrome = find_chrome()
            .context("Chrome not found; install Chrome/Chromium or set PERC_CHROME")?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg(format!("--user-agent={PORTAL_UA}"))
            .window_size(1280, 800);
        if settings.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chrome")?;

        // Drain CDP events for the life of the browser
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to open page")?;

        Ok(Self { browser, page })
    }
}

#[async_trait]
impl PortalPage for ChromiumPage {
    async fn goto(&self, url: &str) -> Result<()> {
        let result = tokio::time::timeout(
            Duration::from_millis(NAV_TIMEOUT_MS),
            self.page.goto(url),
        )
        .await;

        match result {
            Ok(Ok(_page)) => {
                let _ = self.page.wait_for_navigation().await;
                Ok(())
            }
            Ok(Err(e)) => bail!("navigation to {url} failed: {e}"),
            Err(_) => bail!("navigation to {url} timed out after {NAV_TIMEOUT_MS}ms"),
        }
    }

    async fn current_url(&self) -> Result<String> {
        let url = self
            .page
            .url()
            .await
            .context("failed to read page url")?
            .map(|u| u.to_string())
            .unwrap_or_default();
        Ok(url)
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<bool> {
        let Ok(element) = self.page.find_element(selector).await else {
            return Ok(false);
        };
        // an unfillable match counts as a miss so the next selector gets
        // its turn
        if let Err(e) = element.click().await {
            debug!("focus failed on {selector}: {e}");
            return Ok(false);
        }
        if let Err(e) = element.type_str(value).await {
            debug!("typing failed on {selector}: {e}");
            return Ok(false);
        }
        Ok(true)
    }

    async fn click(&self, selector: &str) -> Result<bool> {
        let Ok(element) = self.page.find_element(selector).await else {
            return Ok(false);
        };
        match element.click().await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("click failed on {selector}: {e}");
                Ok(false)
            }
        }
    }

    async fn click_button_with_text(&self, needles: &[&str]) -> Result<bool> {
        let lowered: Vec<String> = needles.iter().map(|n| n.to_lowercase()).collect();
        let needles_json =
            serde_json::to_string(&lowered).unwrap_or_else(|_| "[]".to_string());
        let script = format!(
            "(() => {{ const needles = {needles_json}; \
             const buttons = Array.from(document.querySelectorAll('button')); \
             const hit = buttons.find(b => {{ \
               const t = (b.innerText || '').trim().toLowerCase(); \
               return needles.some(n => t.includes(n)); }}); \
             if (!hit) return false; hit.click(); return true; }})()"
        );

        let result = self
            .page
            .evaluate(script)
            .await
            .context("button text scan failed")?;
        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert scan result: {e:?}"))
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>> {
        let Ok(element) = self.page.find_element(selector).await else {
            return Ok(None);
        };
        match element.attribute(name).await {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!("attribute {name} read failed on {selector}: {e}");
                Ok(None)
            }
        }
    }

    async fn inner_text(&self, selector: &str) -> Result<Option<String>> {
        let Ok(element) = self.page.find_element(selector).await else {
            return Ok(None);
        };
        match element.inner_text().await {
            Ok(text) => Ok(text),
            Err(e) => {
                debug!("inner text read failed on {selector}: {e}");
                Ok(None)
            }
        }
    }

    async fn body_text(&self) -> Result<String> {
        let result = self
            .page
            .evaluate("document.body ? document.body.innerText : ''")
            .await
            .context("body text read failed")?;
        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert body text: {e:?}"))
    }

    async fn read_clipboard(&self) -> Result<Option<String>> {
        // the promise resolves to null when the permission prompt would
        // block; headless denials land in the catch
        let script = "(navigator.clipboard && navigator.clipboard.readText) \
                      ? navigator.clipboard.readText().catch(() => null) : null";
        match self.page.evaluate(script).await {
            Ok(result) => Ok(result.into_value().unwrap_or(None)),
            Err(e) => {
                debug!("clipboard read failed: {e}");
                Ok(None)
            }
        }
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        let quoted = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
        let result = self
            .page
            .evaluate(format!("document.querySelector({quoted}) !== null"))
            .await
            .context("selector probe failed")?;
        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert probe result: {e:?}"))
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        let _ = self.page.close().await;
        if let Err(e) = self.browser.close().await {
            debug!("browser close failed: {e}");
        }
        let _ = self.browser.wait().await;
        Ok(())
    }
}
