//! CLI subcommand implementations for the percolator binary.

pub mod doctor;
pub mod refresh;
pub mod serve;
pub mod status;

use std::sync::Arc;

use tracing::warn;

use crate::config::Settings;
use crate::coordinator::{BrowserLinkSource, Coordinator};
use crate::notify::{MailNotifier, NoopNotifier, Notifier};
use crate::store::CacheStore;

/// Install the global tracing subscriber.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("percolator=info".parse().unwrap()),
        )
        .init();
}

/// Wire settings, snapshot store, browser source, and notifier together.
pub fn build_coordinator(settings: Settings) -> Arc<Coordinator> {
    let store = CacheStore::new(settings.data_dir.clone());
    let notifier: Arc<dyn Notifier> = match MailNotifier::from_settings(&settings.mail) {
        Ok(Some(mailer)) => Arc::new(mailer),
        Ok(None) => {
            warn!("mail not configured (PERC_MAIL_*), usage alerts disabled");
            Arc::new(NoopNotifier)
        }
        Err(e) => {
            warn!("mail notifier unavailable, alerts will be logged only: {e:#}");
            Arc::new(NoopNotifier)
        }
    };
    Arc::new(Coordinator::new(
        settings,
        store,
        Arc::new(BrowserLinkSource),
        notifier,
    ))
}
