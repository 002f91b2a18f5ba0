//! Docker Engine adapter over the local Unix socket.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, RestartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, TagImageOptions};
use bollard::models::{ContainerInspectResponse, EventMessage, HealthStatusEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use super::{
    ContainerDetails, ContainerEngine, ContainerHealth, EngineEvent, HealthState, ImageDetails,
    COMPOSE_PROJECT_LABEL,
};
use crate::reference;

/// Container engine client backed by the local Docker daemon.
///
/// Image references are handed to the client untouched; embedded slashes in
/// image-name parameters must reach the daemon unescaped or lookups fail.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects to the daemon at the default local socket.
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("connect to container engine")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn containers_for_project(&self, project: &str) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{COMPOSE_PROJECT_LABEL}={project}")],
        );
        let options = ListContainersOptions::<String> {
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .with_context(|| format!("list containers for project {project}"))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("inspect container {id}"))?;
        Ok(details_from(info))
    }

    async fn restart_container(&self, id: &str, timeout_secs: i64) -> Result<()> {
        let options = RestartContainerOptions {
            t: timeout_secs as isize,
        };
        self.docker
            .restart_container(id, Some(options))
            .await
            .with_context(|| format!("restart container {id}"))
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()> {
        let options = StopContainerOptions { t: timeout_secs };
        self.docker
            .stop_container(id, Some(options))
            .await
            .with_context(|| format!("stop container {id}"))
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails> {
        let info = self
            .docker
            .inspect_image(reference)
            .await
            .with_context(|| format!("inspect image {reference}"))?;
        Ok(ImageDetails {
            id: info.id.unwrap_or_default(),
            repo_digests: info.repo_digests.unwrap_or_default(),
        })
    }

    async fn tag_image(&self, src: &str, repo: &str, tag: &str) -> Result<()> {
        let options = TagImageOptions {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        self.docker
            .tag_image(src, Some(options))
            .await
            .with_context(|| format!("tag image {src} as {repo}:{tag}"))
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let (repo, tag) = reference::split_image_ref(reference);
        let options = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        // Pulls stream progress messages; the pull is complete once the
        // stream is fully drained.
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step.with_context(|| format!("pull image {reference}"))?;
        }
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.docker
            .remove_image(reference, None, None)
            .await
            .with_context(|| format!("remove image {reference}"))?;
        Ok(())
    }

    fn events(&self) -> BoxStream<'_, Result<EngineEvent>> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec![
                "health_status".to_string(),
                "die".to_string(),
                "start".to_string(),
            ],
        );
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };
        self.docker
            .events(Some(options))
            .map(|item| {
                item.map(event_from)
                    .map_err(|e| anyhow::Error::from(e).context("read engine event"))
            })
            .boxed()
    }
}

fn details_from(info: ContainerInspectResponse) -> ContainerDetails {
    let state = info.state.unwrap_or_default();
    let health = state.health.and_then(|h| {
        let status = match h.status {
            Some(HealthStatusEnum::STARTING) => HealthState::Starting,
            Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy,
            // NONE and EMPTY mean no health check is configured.
            _ => return None,
        };
        let last_output = h
            .log
            .unwrap_or_default()
            .last()
            .and_then(|entry| entry.output.clone())
            .unwrap_or_default();
        Some(ContainerHealth {
            status,
            last_output,
        })
    });
    ContainerDetails {
        id: info.id.unwrap_or_default(),
        name: info
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image_id: info.image.unwrap_or_default(),
        running: state.running.unwrap_or(false),
        health,
    }
}

fn event_from(message: EventMessage) -> EngineEvent {
    let actor = message.actor.unwrap_or_default();
    EngineEvent {
        action: message.action.unwrap_or_default(),
        container_id: actor.id.unwrap_or_default(),
        attributes: actor.attributes.unwrap_or_default(),
    }
}
