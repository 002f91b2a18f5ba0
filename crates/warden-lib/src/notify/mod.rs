//! Alert dispatch to notification channels.

mod discord;
mod mail;
mod webhook;

pub use discord::DiscordNotifier;
pub use mail::MailNotifier;
pub use webhook::{expand_env, WebhookNotifier};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

/// Alert severity, a contract with downstream notifiers (e.g. embed color).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// What happened to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    Started,
    Updated,
    RolledBack,
    NotFound,
    Unhealthy,
    Restarted,
    Healthy,
    Died,
    Critical,
}

impl std::fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertEvent::Started => write!(f, "started"),
            AlertEvent::Updated => write!(f, "updated"),
            AlertEvent::RolledBack => write!(f, "rolled_back"),
            AlertEvent::NotFound => write!(f, "not_found"),
            AlertEvent::Unhealthy => write!(f, "unhealthy"),
            AlertEvent::Restarted => write!(f, "restarted"),
            AlertEvent::Healthy => write!(f, "healthy"),
            AlertEvent::Died => write!(f, "died"),
            AlertEvent::Critical => write!(f, "critical"),
        }
    }
}

/// The value handed to every notifier.
#[derive(Debug, Clone)]
pub struct Alert {
    pub service: String,
    pub event: AlertEvent,
    pub message: String,
    pub reason: Option<String>,
    pub old_digest: Option<String>,
    pub new_digest: Option<String>,
    pub container: Option<String>,
    /// Stamped by the dispatcher when absent.
    pub timestamp: Option<DateTime<Utc>>,
    pub level: AlertLevel,
}

impl Alert {
    pub fn new(
        service: impl Into<String>,
        event: AlertEvent,
        level: AlertLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            event,
            message: message.into(),
            reason: None,
            old_digest: None,
            new_digest: None,
            container: None,
            timestamp: None,
            level,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if !reason.is_empty() {
            self.reason = Some(reason);
        }
        self
    }

    pub fn digests(mut self, old: impl Into<String>, new: impl Into<String>) -> Self {
        self.old_digest = Some(old.into());
        self.new_digest = Some(new.into());
        self
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

/// A single notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> String;

    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Fans alerts out to every configured notifier in order.
///
/// Delivery failures are logged and swallowed; dispatch never fails the
/// control loops.
pub struct Dispatcher {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl Dispatcher {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub async fn send(&self, mut alert: Alert) {
        if alert.timestamp.is_none() {
            alert.timestamp = Some(Utc::now());
        }
        for notifier in &self.notifiers {
            if let Err(error) = notifier.send(&alert).await {
                warn!(notifier = %notifier.name(), error = %error, "notification failed");
            }
        }
    }
}
