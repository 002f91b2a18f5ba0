//! Configuration loading and validation.
//!
//! One JSON document; unknown fields are tolerated so configs survive
//! version skew in both directions. `$VAR` references in webhook header
//! values are expanded from the environment at load time.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use warden_lib::notify::expand_env;
use warden_lib::ServiceSpec;

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// Registry connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub url: String,
    /// Seconds between poll cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Control API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

/// Notification channel settings; every channel is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationConfig {
    pub discord: Option<DiscordConfig>,
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

fn default_registry_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_poll_interval() -> u64 {
    300
}

fn default_api_port() -> u16 {
    9090
}

fn default_smtp_port() -> u16 {
    25
}

impl Config {
    /// Reads, parses and validates the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&data).context("parse config")?;

        config.apply_defaults();
        config.validate()?;

        for webhook in &mut config.notifications.webhooks {
            for value in webhook.headers.values_mut() {
                *value = expand_env(value);
            }
        }

        Ok(config)
    }

    /// Explicit zero values fall back to the documented defaults, same as
    /// absent fields.
    fn apply_defaults(&mut self) {
        if self.registry.url.is_empty() {
            self.registry.url = default_registry_url();
        }
        if self.registry.poll_interval == 0 {
            self.registry.poll_interval = default_poll_interval();
        }
        if self.api.port == 0 {
            self.api.port = default_api_port();
        }
        for svc in &mut self.services {
            if svc.health_grace == 0 {
                svc.health_grace = 60;
            }
            if svc.heal_cooldown == 0 {
                svc.heal_cooldown = 300;
            }
            if svc.heal_max_restarts == 0 {
                svc.heal_max_restarts = 3;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (index, svc) in self.services.iter().enumerate() {
            if svc.name.is_empty() {
                bail!("service[{index}]: name is required");
            }
            if !names.insert(svc.name.as_str()) {
                bail!("service[{index}] {:?}: duplicate service name", svc.name);
            }
            if svc.auto_update {
                if svc.image.is_empty() {
                    bail!(
                        "service[{index}] {:?}: image is required when auto_update is true",
                        svc.name
                    );
                }
                if svc.compose_file.is_empty() {
                    bail!(
                        "service[{index}] {:?}: compose_file is required when auto_update is true",
                        svc.name
                    );
                }
                if svc.compose_project.is_empty() {
                    bail!(
                        "service[{index}] {:?}: compose_project is required when auto_update is true",
                        svc.name
                    );
                }
            }
            if svc.auto_heal && svc.compose_project.is_empty() && svc.container_name.is_empty() {
                bail!(
                    "service[{index}] {:?}: compose_project or container_name is required \
                     when auto_heal is true",
                    svc.name
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn full_config_loads_with_defaults() {
        let file = write_config(
            r#"{
                "registry": {"url": "http://localhost:5000/"},
                "services": [
                    {
                        "name": "api",
                        "image": "api:latest",
                        "compose_file": "/srv/api/compose.yaml",
                        "compose_project": "api",
                        "auto_update": true,
                        "auto_heal": true
                    },
                    {"name": "db", "container_name": "postgres", "auto_heal": true}
                ]
            }"#,
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.registry.poll_interval, 300);
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].health_grace, 60);
        assert_eq!(config.services[1].heal_max_restarts, 3);
    }

    #[test]
    fn zero_durations_fall_back_to_defaults() {
        let file = write_config(
            r#"{
                "registry": {"poll_interval": 0},
                "api": {"port": 0},
                "services": [{"name": "api", "container_name": "api", "health_grace": 0}]
            }"#,
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.registry.poll_interval, 300);
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.services[0].health_grace, 60);
    }

    #[test]
    fn auto_update_requires_deploy_fields() {
        let file = write_config(
            r#"{"services": [{"name": "api", "auto_update": true, "image": "api:latest"}]}"#,
        );

        let error = Config::load(file.path()).unwrap_err();
        assert!(error.to_string().contains("compose_file is required"));
    }

    #[test]
    fn auto_heal_requires_a_matcher() {
        let file = write_config(r#"{"services": [{"name": "api", "auto_heal": true}]}"#);

        let error = Config::load(file.path()).unwrap_err();
        assert!(error
            .to_string()
            .contains("compose_project or container_name is required"));
    }

    #[test]
    fn duplicate_service_names_are_rejected() {
        let file = write_config(
            r#"{"services": [
                {"name": "api", "container_name": "a"},
                {"name": "api", "container_name": "b"}
            ]}"#,
        );

        let error = Config::load(file.path()).unwrap_err();
        assert!(error.to_string().contains("duplicate service name"));
    }

    #[test]
    fn webhook_headers_expand_environment_variables() {
        std::env::set_var("WARDEN_CONFIG_TEST_TOKEN", "tok-123");
        let file = write_config(
            r#"{
                "notifications": {
                    "webhooks": [{
                        "name": "ops",
                        "url": "http://hooks.lan/warden",
                        "headers": {"Authorization": "Bearer $WARDEN_CONFIG_TEST_TOKEN"},
                        "body": "{}"
                    }]
                }
            }"#,
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(
            config.notifications.webhooks[0].headers["Authorization"],
            "Bearer tok-123"
        );
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let error = Config::load(Path::new("/nonexistent/warden.json")).unwrap_err();
        assert!(error.to_string().contains("read config"));
    }
}
