//! Cron-driven refresh loop.
//!
//! Sleeps until the next occurrence of the configured schedule, runs one
//! coordinator cycle, repeats. A failed scheduled refresh is logged and the
//! previous snapshot stays servable; nothing is retried here beyond what the
//! coordinator already does internally.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use cron::Schedule;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;

/// Parse a cron expression, accepting the classic five-field form.
///
/// The schedule engine wants a seconds column; five-field expressions get
/// `0` prepended so `0 3 * * *` means 03:00:00 daily.
pub fn schedule_from(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let with_seconds = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&with_seconds)
        .with_context(|| format!("invalid cron expression {trimmed:?}"))
}

fn next_delay(schedule: &Schedule) -> Option<Duration> {
    let next = schedule.upcoming(Utc).next()?;
    let wait = next - Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

/// Spawn the scheduled-refresh loop until daemon shutdown is signaled.
pub fn spawn(coordinator: Arc<Coordinator>, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
    let expr = coordinator.settings().cron_expr.clone();
    tokio::spawn(async move {
        let schedule = match schedule_from(&expr) {
            Ok(s) => s,
            Err(e) => {
                error!("scheduler disabled: {e:#}");
                return;
            }
        };
        info!("scheduler started: {expr}");

        loop {
            let Some(delay) = next_delay(&schedule) else {
                warn!("cron schedule has no upcoming occurrence; scheduler stopping");
                break;
            };
            info!("next scheduled refresh in {}s", delay.as_secs());

            tokio::select! {
                _ = shutdown.notified() => {
                    info!("scheduler stopping");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    info!("scheduled refresh starting");
                    match coordinator.refresh().await {
                        Ok(url) => info!("scheduled refresh done: {url}"),
                        Err(e) => warn!("scheduled refresh failed: {e}"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::coordinator::BrowserLinkSource;
    use crate::notify::NoopNotifier;
    use crate::store::CacheStore;

    #[test]
    fn five_field_expressions_get_a_seconds_column() {
        assert!(schedule_from("0 3 * * *").is_ok());
        assert!(schedule_from("*/15 * * * *").is_ok());
        // six fields pass through untouched
        assert!(schedule_from("30 0 3 * * *").is_ok());
        assert!(schedule_from("not a schedule").is_err());
    }

    #[test]
    fn daily_schedule_always_has_an_upcoming_run() {
        let schedule = schedule_from("0 3 * * *").unwrap();
        let delay = next_delay(&schedule).unwrap();
        assert!(delay <= Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn every_second_schedule_fires_soon() {
        let schedule = schedule_from("* * * * * *").unwrap();
        let delay = next_delay(&schedule).unwrap();
        assert!(delay <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::from_env();
        settings.cron_expr = "0 3 * * *".to_string();
        let coordinator = Arc::new(Coordinator::new(
            settings,
            CacheStore::new(dir.path()),
            Arc::new(BrowserLinkSource),
            Arc::new(NoopNotifier),
        ));

        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();
        let handle = spawn(coordinator, shutdown);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop on shutdown")
            .unwrap();
    }
}
