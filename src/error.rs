//! Error taxonomy for the refresh pipeline.
//!
//! Only failures that abort a refresh cycle are represented here. Malformed
//! payload lines and unparseable documents are never fatal — they degrade to
//! dropped nodes and zero counts inside the normalizer. Notification delivery
//! failures are logged and swallowed by the coordinator.

use thiserror::Error;

/// Failure of a refresh cycle.
///
/// Variants carry rendered messages rather than source errors so that an
/// outcome can be cloned to every caller that joined an in-flight cycle.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    /// The browser session could not reach the dashboard or extract a URL.
    #[error("portal acquisition failed: {0}")]
    Acquisition(String),

    /// Network or HTTP failure while downloading the subscription payload.
    #[error("subscription fetch failed: {0}")]
    Fetch(String),

    /// The snapshot could not be written to disk.
    #[error("snapshot persistence failed: {0}")]
    Persistence(String),

    /// Every acquisition attempt failed; carries the last per-attempt error.
    #[error("refresh exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

pub type RefreshResult<T> = Result<T, RefreshError>;
