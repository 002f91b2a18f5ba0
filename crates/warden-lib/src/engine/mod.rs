//! Container engine abstraction.
//!
//! The control loops consume a narrow contract over the local container
//! engine; the production implementation in [`docker`] speaks to the daemon
//! over its Unix socket. Keeping the seam here lets tests script engine
//! behavior without a daemon.

mod docker;

pub use docker::DockerEngine;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Label compose attaches to every container it manages.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Health-check state reported by a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Starting => write!(f, "starting"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
            HealthState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health-check status plus the most recent probe output.
#[derive(Debug, Clone)]
pub struct ContainerHealth {
    pub status: HealthState,
    pub last_output: String,
}

/// Container details from the inspect endpoint, reduced to what the control
/// loops consume. `health` is `None` when no health check is configured.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    /// Container name without the leading slash the engine prepends.
    pub name: String,
    /// Image ID (`sha256:…`) the container was created from.
    pub image_id: String,
    pub running: bool,
    pub health: Option<ContainerHealth>,
}

/// Image details from the inspect endpoint.
#[derive(Debug, Clone)]
pub struct ImageDetails {
    pub id: String,
    /// Repo digest entries of the form `registry/name@sha256:…`.
    pub repo_digests: Vec<String>,
}

impl ImageDetails {
    /// Returns the registry digest recorded for the given repository, if any.
    pub fn digest_for(&self, repo: &str) -> Option<String> {
        self.repo_digests.iter().find_map(|entry| {
            entry
                .strip_prefix(repo)
                .and_then(|rest| rest.strip_prefix('@'))
                .map(str::to_string)
        })
    }
}

/// One event from the engine's event stream.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    /// Action string, e.g. `die` or `health_status: unhealthy`.
    pub action: String,
    pub container_id: String,
    pub attributes: HashMap<String, String>,
}

impl EngineEvent {
    /// Container name from the event attributes. Inspect responses carry a
    /// leading slash, event payloads do not; both forms are normalised here.
    pub fn container_name(&self) -> &str {
        self.attributes
            .get("name")
            .map(String::as_str)
            .unwrap_or("")
            .trim_start_matches('/')
    }

    /// Compose project label, empty for standalone containers.
    pub fn compose_project(&self) -> &str {
        self.attributes
            .get(COMPOSE_PROJECT_LABEL)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Contract over the local container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// IDs of running containers labelled with the given compose project.
    async fn containers_for_project(&self, project: &str) -> Result<Vec<String>>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    /// Restarts a container, giving it `timeout_secs` to stop gracefully.
    async fn restart_container(&self, id: &str, timeout_secs: i64) -> Result<()>;

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails>;

    /// Tags `src` (reference or ID) as `repo:tag`.
    async fn tag_image(&self, src: &str, repo: &str, tag: &str) -> Result<()>;

    /// Pulls an image, draining the progress stream to completion.
    async fn pull_image(&self, reference: &str) -> Result<()>;

    async fn remove_image(&self, reference: &str) -> Result<()>;

    /// Opens the engine event stream, filtered to container health, die and
    /// start events. The stream ends on transport failure; the caller owns
    /// reconnection.
    fn events(&self) -> BoxStream<'_, Result<EngineEvent>>;
}
