//! SMTP mail notifier.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{Alert, Notifier};

/// Sends alerts as plain-text mail through a relay, typically a local or
/// intranet SMTP host. Authentication is optional (PLAIN when configured).
pub struct MailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl MailNotifier {
    pub fn new(
        host: &str,
        port: u16,
        from: &str,
        to: &str,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(port);
        if !username.is_empty() {
            builder = builder.credentials(Credentials::new(
                username.to_string(),
                password.to_string(),
            ));
        }
        Ok(Self {
            transport: builder.build(),
            from: from
                .parse()
                .with_context(|| format!("invalid mail sender {from:?}"))?,
            to: to
                .parse()
                .with_context(|| format!("invalid mail recipient {to:?}"))?,
        })
    }

    fn body_for(alert: &Alert) -> String {
        let mut body = String::new();
        body.push_str(&format!("Service: {}\n", alert.service));
        body.push_str(&format!("Event: {}\n", alert.event));
        if let Some(container) = &alert.container {
            body.push_str(&format!("Container: {container}\n"));
        }
        if let Some(timestamp) = alert.timestamp {
            body.push_str(&format!(
                "Time: {}\n",
                timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        body.push('\n');
        body.push_str(&alert.message);
        if let Some(reason) = &alert.reason {
            body.push_str(&format!("\n\nReason: {reason}"));
        }
        if let Some(old) = &alert.old_digest {
            body.push_str(&format!("\nOld digest: {old}"));
        }
        if let Some(new) = &alert.new_digest {
            body.push_str(&format!("\nNew digest: {new}"));
        }
        body
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    fn name(&self) -> String {
        "mail".to_string()
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let subject = format!(
            "[warden] [{}] {}: {}",
            alert.level, alert.event, alert.service
        );
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(Self::body_for(alert))
            .context("build mail message")?;

        self.transport
            .send(message)
            .await
            .context("send mail")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{AlertEvent, AlertLevel};

    #[test]
    fn body_carries_reason_and_digests() {
        let alert = Alert::new(
            "api",
            AlertEvent::RolledBack,
            AlertLevel::Warning,
            "Rolled back to previous image.",
        )
        .reason("health check timed out")
        .digests("sha256:aaa", "sha256:bbb")
        .container("api-1");

        let body = MailNotifier::body_for(&alert);
        assert!(body.contains("Service: api"));
        assert!(body.contains("Container: api-1"));
        assert!(body.contains("Reason: health check timed out"));
        assert!(body.contains("Old digest: sha256:aaa"));
        assert!(body.contains("New digest: sha256:bbb"));
    }
}
