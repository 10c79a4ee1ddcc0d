//! Authenticated portal session: login, dashboard, subscription-link modal.
//!
//! The session protocol lives here, expressed against the [`PortalPage`]
//! trait so the whole flow is testable without a browser; `chromium` holds
//! the real CDP-backed page. Selector lists are ordered fallbacks tuned to
//! one provider's dashboard — first hit wins, the rest are skipped. Every
//! lookup primitive distinguishes "not there" (`Ok(None)` / `Ok(false)`,
//! try the next strategy) from "session broken" (`Err`, abort).

pub mod chromium;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::model::UsageInfo;
use crate::usage;

const LOGIN_ROUTE: &str = "#/login";
const DASHBOARD_MARKER: &str = "#/dashboard";
const CLIPBOARD_ATTR: &str = "data-clipboard-text";

/// SPA bootstrap can keep rewriting the URL after the first redirect.
const SPA_SETTLE_MS: u64 = 10_000;
const DASHBOARD_WAIT_MS: u64 = 60_000;
const MODAL_WAIT_MS: u64 = 30_000;
const CLICK_SETTLE_MS: u64 = 1_000;
const POLL_INTERVAL_MS: u64 = 250;

/// Dashboard panel that opens the subscription modal.
const PANEL_SELECTOR: &str = "#main-container > div > div:nth-child(3) > div > div > div.block-content.p-0 > div > div > div:nth-child(2)";
const MODAL_SELECTOR: &str = "body div.ant-modal-wrap.ant-modal-centered";
const LINK_ITEM_SELECTOR: &str = "div.item___yrtOv.subsrcibe-for-link";

const USERNAME_SELECTORS: &[&str] = &[
    "input[placeholder*=\"邮箱\"]",
    "input[placeholder*=\"email\" i]",
    "input[type=\"email\"]",
    ".block-content input[type=\"text\"]",
    "input.form-control-alt[type=\"text\"]",
    "input[type=\"text\"]",
];

const PASSWORD_SELECTORS: &[&str] = &[
    "input[placeholder*=\"密码\"]",
    "input[placeholder*=\"password\" i]",
    "input[type=\"password\"]",
    ".block-content input[type=\"password\"]",
];

const SUBMIT_SELECTORS: &[&str] = &["button[type=\"submit\"]", "button.btn-primary"];
const SUBMIT_TEXTS: &[&str] = &["登录", "登入", "sign in", "log in"];

/// Everything the session protocol needs from a page.
///
/// `Ok(false)` / `Ok(None)` mean the element (or value) is absent; `Err`
/// means the page itself failed. Implementations must never turn a missed
/// selector into an error.
#[async_trait]
pub trait PortalPage: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;
    async fn current_url(&self) -> Result<String>;
    /// Fill the first element matching `selector`.
    async fn fill(&self, selector: &str, value: &str) -> Result<bool>;
    /// Click the first element matching `selector`.
    async fn click(&self, selector: &str) -> Result<bool>;
    /// Click the first `<button>` whose visible text contains any needle
    /// (case-insensitive).
    async fn click_button_with_text(&self, needles: &[&str]) -> Result<bool>;
    /// Read an attribute off the first match.
    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>>;
    /// Visible text of the first match.
    async fn inner_text(&self, selector: &str) -> Result<Option<String>>;
    /// Visible text of the whole page.
    async fn body_text(&self) -> Result<String>;
    /// Last clipboard value; permission denial reads as absence.
    async fn read_clipboard(&self) -> Result<Option<String>>;
    /// Whether `selector` currently matches anything.
    async fn exists(&self, selector: &str) -> Result<bool>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Where the session currently is. Logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Landed,
    Authenticating,
    Dashboard,
    ModalOpen,
    UrlExtracted,
}

/// Outcome of a successful session.
#[derive(Debug, Clone)]
pub struct PortalAcquisition {
    pub url: String,
    /// Usage surfaced from dashboard text, when the scrape found any.
    pub usage: Option<UsageInfo>,
}

/// Run the full session protocol and always close the page, success or not.
pub async fn acquire(page: Box<dyn PortalPage>, settings: &Settings) -> Result<PortalAcquisition> {
    let outcome = drive(page.as_ref(), settings).await;
    if let Err(e) = page.close().await {
        warn!("portal page close failed: {e:#}");
    }
    outcome
}

/// The session protocol: land, settle, authenticate if needed, scrape usage,
/// open the modal, walk the extraction chain.
async fn drive(page: &dyn PortalPage, settings: &Settings) -> Result<PortalAcquisition> {
    let base = settings
        .portal_url
        .as_deref()
        .context("portal address not configured (set PERC_PORTAL_URL)")?;
    let mut phase = Phase::Start;
    debug!("phase: {phase:?}");

    page.goto(base).await.context("landing navigation failed")?;
    phase = Phase::Landed;
    debug!("phase: {phase:?}");

    // let the client-side redirect land, then give the SPA time to settle
    let _ = wait_for_url(page, |u| u != base, settings.redirect_timeout).await?;
    tokio::time::sleep(Duration::from_millis(SPA_SETTLE_MS)).await;

    let current = page.current_url().await.unwrap_or_default();
    let origin = resolve_origin(base, &current);
    if origin != trim_base(base) {
        info!("portal redirected; adopting origin {origin}");
    }

    if !current.contains(DASHBOARD_MARKER) {
        phase = Phase::Authenticating;
        debug!("phase: {phase:?}");
        login(page, settings, &origin).await?;
    }
    phase = Phase::Dashboard;
    debug!("phase: {phase:?}");

    // best-effort usage scrape; absence is normal
    let usage = match page.body_text().await {
        Ok(text) => usage::from_dashboard_text(&text),
        Err(e) => {
            debug!("dashboard text unavailable: {e:#}");
            None
        }
    };
    if let Some(u) = &usage {
        info!("dashboard usage: {}", usage::describe(u));
    }

    tokio::time::sleep(Duration::from_millis(CLICK_SETTLE_MS)).await;
    if !page.click(PANEL_SELECTOR).await? {
        bail!("subscription panel not found on dashboard");
    }
    if !wait_for_selector(page, MODAL_SELECTOR, Duration::from_millis(MODAL_WAIT_MS)).await? {
        bail!("subscription modal never appeared (waited {MODAL_WAIT_MS}ms)");
    }
    phase = Phase::ModalOpen;
    debug!("phase: {phase:?}");

    let item_selector = format!("{MODAL_SELECTOR} {LINK_ITEM_SELECTOR}");
    if !page.click(&item_selector).await? {
        bail!("subscription link item not found in modal");
    }
    tokio::time::sleep(Duration::from_millis(CLICK_SETTLE_MS)).await;

    match extract_link(page, &item_selector).await? {
        Some(url) => {
            phase = Phase::UrlExtracted;
            debug!("phase: {phase:?}");
            Ok(PortalAcquisition { url, usage })
        }
        None => bail!("all link extraction strategies exhausted"),
    }
}

/// Credential entry plus the dashboard wait. Reaching the dashboard without
/// filling anything (a live session cookie) is fine.
async fn login(page: &dyn PortalPage, settings: &Settings, origin: &str) -> Result<()> {
    let login_url = format!("{origin}/{LOGIN_ROUTE}");
    page.goto(&login_url).await.context("login navigation failed")?;
    tokio::time::sleep(settings.step_delay).await;

    // the login route can bounce straight to the dashboard
    let current = page.current_url().await.unwrap_or_default();
    if !current.contains(DASHBOARD_MARKER) {
        match &settings.portal_user {
            Some(user) => {
                if !fill_first(page, USERNAME_SELECTORS, user).await? {
                    warn!("no username field matched any selector");
                }
            }
            None => warn!("PERC_PORTAL_USER not set; skipping credential entry"),
        }
        tokio::time::sleep(settings.step_delay).await;

        match &settings.portal_pass {
            Some(pass) => {
                if !fill_first(page, PASSWORD_SELECTORS, pass).await? {
                    warn!("no password field matched any selector");
                }
            }
            None => warn!("PERC_PORTAL_PASS not set; skipping password entry"),
        }
        tokio::time::sleep(settings.step_delay).await;

        if !click_submit(page).await? {
            warn!("no submit control matched any selector");
        }
    }

    let reached = wait_for_url(
        page,
        |u| u.contains(DASHBOARD_MARKER),
        Duration::from_millis(DASHBOARD_WAIT_MS),
    )
    .await?;
    if reached.is_none() {
        bail!("dashboard never appeared after login (waited {DASHBOARD_WAIT_MS}ms)");
    }
    Ok(())
}

// ── Link extraction chain ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStrategy {
    /// `data-clipboard-text` on the clicked item.
    ItemAttribute,
    /// The same attribute anywhere on the page.
    AnyAttribute,
    /// Whatever the copy widget put on the clipboard.
    Clipboard,
    /// Click once more, then re-read the item attribute.
    ReclickAttribute,
    /// Absolute URL inside the item's visible text.
    VisibleText,
}

const LINK_STRATEGIES: [LinkStrategy; 5] = [
    LinkStrategy::ItemAttribute,
    LinkStrategy::AnyAttribute,
    LinkStrategy::Clipboard,
    LinkStrategy::ReclickAttribute,
    LinkStrategy::VisibleText,
];

async fn extract_link(page: &dyn PortalPage, item_selector: &str) -> Result<Option<String>> {
    for strategy in LINK_STRATEGIES {
        match try_strategy(page, strategy, item_selector).await? {
            Some(url) => {
                info!("subscription link extracted via {strategy:?}");
                return Ok(Some(url));
            }
            None => debug!("{strategy:?} found nothing"),
        }
    }
    Ok(None)
}

async fn try_strategy(
    page: &dyn PortalPage,
    strategy: LinkStrategy,
    item_selector: &str,
) -> Result<Option<String>> {
    match strategy {
        LinkStrategy::ItemAttribute => {
            Ok(non_empty(page.attribute(item_selector, CLIPBOARD_ATTR).await?))
        }
        LinkStrategy::AnyAttribute => Ok(non_empty(
            page.attribute(&format!("[{CLIPBOARD_ATTR}]"), CLIPBOARD_ATTR)
                .await?,
        )),
        LinkStrategy::Clipboard => Ok(page
            .read_clipboard()
            .await?
            .filter(|value| is_absolute_url(value))),
        LinkStrategy::ReclickAttribute => {
            if !page.click(item_selector).await? {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(CLICK_SETTLE_MS)).await;
            Ok(non_empty(page.attribute(item_selector, CLIPBOARD_ATTR).await?))
        }
        LinkStrategy::VisibleText => {
            let Some(text) = page.inner_text(item_selector).await? else {
                return Ok(None);
            };
            let url_re = Regex::new(r"https?://[^\s]+").expect("url regex is valid");
            Ok(url_re.find(&text).map(|m| m.as_str().to_string()))
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

async fn fill_first(page: &dyn PortalPage, selectors: &[&str], value: &str) -> Result<bool> {
    for selector in selectors {
        if page.fill(selector, value).await? {
            debug!("filled {selector}");
            return Ok(true);
        }
    }
    Ok(false)
}

async fn click_submit(page: &dyn PortalPage) -> Result<bool> {
    if page.click_button_with_text(SUBMIT_TEXTS).await? {
        return Ok(true);
    }
    for selector in SUBMIT_SELECTORS {
        if page.click(selector).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn wait_for_url(
    page: &dyn PortalPage,
    pred: impl Fn(&str) -> bool,
    timeout: Duration,
) -> Result<Option<String>> {
    let start = tokio::time::Instant::now();
    loop {
        let url = page.current_url().await?;
        if !url.is_empty() && pred(&url) {
            return Ok(Some(url));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}

async fn wait_for_selector(
    page: &dyn PortalPage,
    selector: &str,
    timeout: Duration,
) -> Result<bool> {
    let start = tokio::time::Instant::now();
    loop {
        if page.exists(selector).await? {
            return Ok(true);
        }
        if start.elapsed() >= timeout {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}

/// Origin of wherever the landing redirect put us, falling back to the
/// configured base when the current URL is unusable.
fn resolve_origin(base: &str, current: &str) -> String {
    if is_absolute_url(current) {
        if let Ok(url) = url::Url::parse(current) {
            let origin = url.origin().ascii_serialization();
            if is_absolute_url(&origin) {
                return origin;
            }
        }
    }
    trim_base(base)
}

fn trim_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}

fn is_absolute_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
