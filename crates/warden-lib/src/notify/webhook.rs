//! User-defined HTTP webhook notifier.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Method;

use super::{Alert, Notifier};

/// Sends alerts to an arbitrary HTTP endpoint.
///
/// The body is a template in which `{{service}}`, `{{event}}`, `{{message}}`,
/// `{{reason}}`, `{{old_digest}}`, `{{new_digest}}`, `{{container}}`,
/// `{{timestamp}}` and `{{level}}` are replaced per alert. Header values are
/// expected to be env-expanded at config load; the URL may carry `$VAR`
/// references expanded at send time.
pub struct WebhookNotifier {
    name: String,
    url: String,
    method: Method,
    headers: HashMap<String, String>,
    body_template: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(
        name: &str,
        url: &str,
        method: &str,
        headers: HashMap<String, String>,
        body_template: &str,
    ) -> Result<Self> {
        let method = if method.is_empty() {
            Method::POST
        } else {
            method
                .parse()
                .with_context(|| format!("webhook {name}: invalid method {method:?}"))?
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build webhook HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            method,
            headers,
            body_template: body_template.to_string(),
            client,
        })
    }

    fn render(&self, alert: &Alert) -> String {
        self.body_template
            .replace("{{service}}", &alert.service)
            .replace("{{event}}", &alert.event.to_string())
            .replace("{{message}}", &alert.message)
            .replace("{{reason}}", alert.reason.as_deref().unwrap_or(""))
            .replace("{{old_digest}}", alert.old_digest.as_deref().unwrap_or(""))
            .replace("{{new_digest}}", alert.new_digest.as_deref().unwrap_or(""))
            .replace("{{container}}", alert.container.as_deref().unwrap_or(""))
            .replace(
                "{{timestamp}}",
                &alert
                    .timestamp
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            )
            .replace("{{level}}", &alert.level.to_string())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> String {
        format!("webhook:{}", self.name)
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let body = self.render(alert);
        let url = expand_env(&self.url);

        let mut request = self.client.request(self.method.clone(), &url).body(body);
        let mut has_content_type = false;
        for (key, value) in &self.headers {
            request = request.header(key, value);
            if key.eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
        }
        if !has_content_type {
            request = request.header("Content-Type", "application/json");
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("webhook {:?}", self.name))?;
        if !response.status().is_success() {
            bail!("webhook {:?}: HTTP {}", self.name, response.status());
        }
        Ok(())
    }
}

/// Expands `$VAR` and `${VAR}` references from the process environment.
/// Unset variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(braced) = after.strip_prefix('{') {
            if let Some(close) = braced.find('}') {
                out.push_str(&std::env::var(&braced[..close]).unwrap_or_default());
                rest = &braced[close + 1..];
                continue;
            }
            out.push('$');
            rest = after;
            continue;
        }
        let len = after
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        if len == 0 {
            out.push('$');
            rest = after;
            continue;
        }
        out.push_str(&std::env::var(&after[..len]).unwrap_or_default());
        rest = &after[len..];
    }
    out.push_str(rest);
    out
}
