//! Usage alerting.
//!
//! Alerts go out through the [`Notifier`] seam so the coordinator never
//! knows whether mail is configured. Delivery problems are the caller's to
//! log and swallow — an alert must never fail a refresh.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use crate::config::MailSettings;

const SMTPS_PORT: u16 = 465;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

/// Used when mail is not configured; swallows alerts with a debug line.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, subject: &str, _body: &str) -> Result<()> {
        debug!("alert suppressed (mail not configured): {subject}");
        Ok(())
    }
}

/// SMTP-backed notifier. Port 465 speaks implicit TLS, anything else
/// STARTTLS.
pub struct MailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl MailNotifier {
    /// Build from settings. `Ok(None)` means mail is simply not configured;
    /// `Err` means it is configured but malformed.
    pub fn from_settings(mail: &MailSettings) -> Result<Option<Self>> {
        if !mail.is_configured() {
            return Ok(None);
        }
        let host = mail.host.as_deref().unwrap_or_default();
        let to_addr = mail.to.as_deref().unwrap_or_default();
        let from_addr = mail.sender().unwrap_or_default();

        let from: Mailbox = from_addr
            .parse()
            .with_context(|| format!("invalid mail sender {from_addr:?}"))?;
        let to: Mailbox = to_addr
            .parse()
            .with_context(|| format!("invalid mail recipient {to_addr:?}"))?;

        let mut builder = if mail.port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        }
        .with_context(|| format!("smtp relay setup for {host} failed"))?
        .port(mail.port);

        if let (Some(user), Some(pass)) = (&mail.user, &mail.pass) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Some(Self {
            transport: builder.build(),
            from,
            to,
        }))
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .body(body.to_string())
            .context("failed to build alert mail")?;

        self.transport
            .send(email)
            .await
            .context("smtp delivery failed")?;
        info!("usage alert sent to {}", self.to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> MailSettings {
        MailSettings {
            host: Some("smtp.example.com".into()),
            port: 465,
            user: Some("bot@example.com".into()),
            pass: Some("hunter2".into()),
            from: Some("percolator@example.com".into()),
            to: Some("ops@example.com".into()),
        }
    }

    #[test]
    fn unconfigured_mail_yields_none() {
        assert!(MailNotifier::from_settings(&MailSettings::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn configured_mail_builds() {
        assert!(MailNotifier::from_settings(&configured()).unwrap().is_some());
    }

    #[test]
    fn sender_falls_back_to_login_user() {
        let mut mail = configured();
        mail.from = None;
        let notifier = MailNotifier::from_settings(&mail).unwrap().unwrap();
        assert_eq!(notifier.from.email.to_string(), "bot@example.com");
    }

    #[test]
    fn malformed_recipient_is_an_error() {
        let mut mail = configured();
        mail.to = Some("not an address".into());
        assert!(MailNotifier::from_settings(&mail).is_err());
    }
}
