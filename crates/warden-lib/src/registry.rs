//! Registry digest lookups over the Distribution HTTP API v2.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;

use crate::reference;

/// Accept header required to receive the v2 manifest digest.
const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Contract for remote digest resolution.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Current manifest digest for a registry-relative `name:tag` reference.
    async fn remote_digest(&self, image: &str) -> Result<String>;
}

/// Registry client for a private HTTP registry.
pub struct HttpRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRegistry {
    /// Creates a client for the given base URL (e.g. `http://localhost:5000`).
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build registry HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl ImageRegistry for HttpRegistry {
    async fn remote_digest(&self, image: &str) -> Result<String> {
        let name = reference::image_name(image);
        let tag = reference::image_tag(image);
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, name, tag);

        // HEAD keeps this cheap; the digest comes back in a response header.
        let response = self
            .client
            .head(&url)
            .header("Accept", MANIFEST_V2)
            .send()
            .await
            .with_context(|| format!("HEAD {url}"))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            bail!("image {name}:{tag} not found in registry");
        }
        if status != StatusCode::OK {
            bail!("HEAD {url}: HTTP {status}");
        }

        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if digest.is_empty() {
            bail!("no Docker-Content-Digest header for {name}:{tag}");
        }
        Ok(digest.to_string())
    }
}
