//! Discord webhook notifier.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::{Alert, AlertLevel, Notifier};
use crate::reference::short_digest;

#[derive(Serialize)]
struct DiscordPayload {
    embeds: Vec<DiscordEmbed>,
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    timestamp: String,
}

/// Sends alerts to a Discord channel through an incoming webhook.
pub struct DiscordNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(webhook_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build discord HTTP client")?;
        Ok(Self {
            webhook_url: webhook_url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn name(&self) -> String {
        "discord".to_string()
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let mut description = alert.message.clone();
        if let Some(reason) = &alert.reason {
            description.push_str("\nReason: ");
            description.push_str(reason);
        }
        if let (Some(old), Some(new)) = (&alert.old_digest, &alert.new_digest) {
            description.push_str(&format!(
                "\nOld: {}\nNew: {}",
                short_digest(old),
                short_digest(new)
            ));
        }

        let payload = DiscordPayload {
            embeds: vec![DiscordEmbed {
                title: format!("[{}] {}: {}", alert.level, alert.event, alert.service),
                description,
                color: color_for(alert.level),
                timestamp: alert
                    .timestamp
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            }],
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("discord webhook")?;
        if !response.status().is_success() {
            bail!("discord webhook: HTTP {}", response.status());
        }
        Ok(())
    }
}

fn color_for(level: AlertLevel) -> u32 {
    match level {
        AlertLevel::Critical => 15158332, // red
        AlertLevel::Warning => 16776960,  // yellow
        AlertLevel::Info => 3066993,      // green
    }
}
