//! Environment-driven runtime settings.
//!
//! Everything is read once at startup from `PERC_*` variables; there is no
//! config file. Missing optional values degrade features (no credentials =
//! no automatic login, no mail host = no alerts) rather than abort.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DATA_DIR: &str = ".data";
const DEFAULT_STEP_DELAY_MS: u64 = 300;
const DEFAULT_REDIRECT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_CRON: &str = "0 3 * * *";
const DEFAULT_USAGE_THRESHOLD: f64 = 0.5;
const DEFAULT_MAIL_PORT: u16 = 465;

/// Runtime settings, resolved once from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Portal landing address (`PERC_PORTAL_URL`). Required for acquisition.
    pub portal_url: Option<String>,
    pub portal_user: Option<String>,
    pub portal_pass: Option<String>,
    /// Run Chrome headless (`PERC_HEADLESS`, default true).
    pub headless: bool,
    /// Pause between scripted browser actions (`PERC_STEP_DELAY_MS`).
    pub step_delay: Duration,
    /// How long to let the landing page redirect before moving on
    /// (`PERC_REDIRECT_TIMEOUT_MS`).
    pub redirect_timeout: Duration,
    /// Snapshot directory (`PERC_DATA_DIR`, default `.data`).
    pub data_dir: PathBuf,
    /// Shared secret for the manual refresh endpoint (`PERC_API_KEY`).
    /// Unset means the endpoint rejects every call.
    pub api_key: Option<String>,
    pub port: u16,
    /// Refresh schedule (`PERC_CRON`, five-field cron, default 03:00 daily).
    pub cron_expr: String,
    pub cron_enabled: bool,
    /// Kick off a refresh at startup (`PERC_INIT_REFRESH`, default false).
    pub init_refresh: bool,
    /// Alert when used/total exceeds this fraction (`PERC_USAGE_THRESHOLD`).
    pub usage_threshold: f64,
    pub mail: MailSettings,
}

/// SMTP alert delivery settings (`PERC_MAIL_*`).
#[derive(Debug, Clone, Default)]
pub struct MailSettings {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl MailSettings {
    /// True when enough is present to deliver an alert: a relay host, a
    /// recipient, and a sender (explicit `from` or the login user).
    pub fn is_configured(&self) -> bool {
        self.host.is_some() && self.to.is_some() && (self.from.is_some() || self.user.is_some())
    }

    pub fn sender(&self) -> Option<&str> {
        self.from.as_deref().or(self.user.as_deref())
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            portal_url: read_env_string("PERC_PORTAL_URL"),
            portal_user: read_env_string("PERC_PORTAL_USER"),
            portal_pass: read_env_string("PERC_PORTAL_PASS"),
            headless: read_env_bool("PERC_HEADLESS", true),
            step_delay: Duration::from_millis(read_env_u64(
                "PERC_STEP_DELAY_MS",
                DEFAULT_STEP_DELAY_MS,
            )),
            redirect_timeout: Duration::from_millis(read_env_u64(
                "PERC_REDIRECT_TIMEOUT_MS",
                DEFAULT_REDIRECT_TIMEOUT_MS,
            )),
            data_dir: PathBuf::from(
                read_env_string("PERC_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            ),
            api_key: read_env_string("PERC_API_KEY"),
            port: read_env_u16("PERC_PORT", DEFAULT_PORT),
            cron_expr: read_env_string("PERC_CRON").unwrap_or_else(|| DEFAULT_CRON.to_string()),
            cron_enabled: read_env_bool("PERC_CRON_ENABLED", true),
            init_refresh: read_env_bool("PERC_INIT_REFRESH", false),
            usage_threshold: read_env_f64("PERC_USAGE_THRESHOLD", DEFAULT_USAGE_THRESHOLD),
            mail: MailSettings {
                host: read_env_string("PERC_MAIL_HOST"),
                port: read_env_u16("PERC_MAIL_PORT", DEFAULT_MAIL_PORT),
                user: read_env_string("PERC_MAIL_USER"),
                pass: read_env_string("PERC_MAIL_PASS"),
                from: read_env_string("PERC_MAIL_FROM"),
                to: read_env_string("PERC_MAIL_TO"),
            },
        }
    }
}

// ── Env helpers ──────────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn read_env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn read_env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn read_env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}
