//! Shared mock collaborators for control-loop tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::compose::ComposeRunner;
use crate::engine::{
    ContainerDetails, ContainerEngine, ContainerHealth, EngineEvent, HealthState, ImageDetails,
    COMPOSE_PROJECT_LABEL,
};
use crate::models::ServiceSpec;
use crate::notify::{Alert, Notifier};
use crate::registry::ImageRegistry;

/// Scriptable engine: containers per project, queued inspect responses
/// (the last entry repeats), recorded tag/restart/remove calls, and a
/// one-shot event stream that stays open after draining.
#[derive(Default)]
pub struct MockEngine {
    pub containers: Mutex<HashMap<String, Vec<String>>>,
    pub details: Mutex<HashMap<String, VecDeque<ContainerDetails>>>,
    pub images: Mutex<HashMap<String, ImageDetails>>,
    pub tags: Mutex<Vec<(String, String, String)>>,
    pub restarts: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub events: Mutex<Vec<EngineEvent>>,
    pub fail_restart: AtomicBool,
}

impl MockEngine {
    pub fn add_container(&self, project: &str, id: &str) {
        self.containers
            .lock()
            .unwrap()
            .entry(project.to_string())
            .or_default()
            .push(id.to_string());
    }

    pub fn script_details(&self, id: &str, sequence: Vec<ContainerDetails>) {
        self.details
            .lock()
            .unwrap()
            .insert(id.to_string(), sequence.into());
    }

    pub fn put_image(&self, reference: &str, image: ImageDetails) {
        self.images
            .lock()
            .unwrap()
            .insert(reference.to_string(), image);
    }

    pub fn push_event(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn containers_for_project(&self, project: &str) -> Result<Vec<String>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(project)
            .cloned()
            .unwrap_or_default())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let mut details = self.details.lock().unwrap();
        let queue = details
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such container: {id}"))?;
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else {
            queue
                .front()
                .cloned()
                .ok_or_else(|| anyhow!("no such container: {id}"))
        }
    }

    async fn restart_container(&self, id: &str, _timeout_secs: i64) -> Result<()> {
        if self.fail_restart.load(Ordering::SeqCst) {
            anyhow::bail!("restart refused");
        }
        self.restarts.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn stop_container(&self, _id: &str, _timeout_secs: i64) -> Result<()> {
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails> {
        self.images
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow!("no such image: {reference}"))
    }

    async fn tag_image(&self, src: &str, repo: &str, tag: &str) -> Result<()> {
        self.tags
            .lock()
            .unwrap()
            .push((src.to_string(), repo.to_string(), tag.to_string()));
        // Mirror the engine: the new reference resolves to the same image.
        let mut images = self.images.lock().unwrap();
        if let Some(image) = images.get(src).cloned() {
            images.insert(format!("{repo}:{tag}"), image);
        }
        Ok(())
    }

    async fn pull_image(&self, _reference: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.removed.lock().unwrap().push(reference.to_string());
        Ok(())
    }

    fn events(&self) -> BoxStream<'_, Result<EngineEvent>> {
        let events: Vec<_> = self.events.lock().unwrap().drain(..).collect();
        stream::iter(events.into_iter().map(Ok))
            .chain(stream::pending())
            .boxed()
    }
}

pub struct MockRegistry {
    digest: Mutex<Result<String, String>>,
}

impl MockRegistry {
    pub fn with_digest(digest: &str) -> Self {
        Self {
            digest: Mutex::new(Ok(digest.to_string())),
        }
    }

    pub fn set_digest(&self, digest: &str) {
        *self.digest.lock().unwrap() = Ok(digest.to_string());
    }

    pub fn set_error(&self, message: &str) {
        *self.digest.lock().unwrap() = Err(message.to_string());
    }
}

#[async_trait]
impl ImageRegistry for MockRegistry {
    async fn remote_digest(&self, _image: &str) -> Result<String> {
        match &*self.digest.lock().unwrap() {
            Ok(digest) => Ok(digest.clone()),
            Err(message) => Err(anyhow!("{message}")),
        }
    }
}

#[derive(Default)]
pub struct MockCompose {
    pub calls: Mutex<Vec<String>>,
    pub fail_pull: AtomicBool,
    pub fail_up: AtomicBool,
}

#[async_trait]
impl ComposeRunner for MockCompose {
    async fn pull(&self, _token: &CancellationToken, _file: &str, project: &str) -> Result<()> {
        if self.fail_pull.load(Ordering::SeqCst) {
            anyhow::bail!("pull failed");
        }
        self.calls.lock().unwrap().push(format!("pull {project}"));
        Ok(())
    }

    async fn up(&self, _token: &CancellationToken, _file: &str, project: &str) -> Result<()> {
        if self.fail_up.load(Ordering::SeqCst) {
            anyhow::bail!("up failed");
        }
        self.calls.lock().unwrap().push(format!("up {project}"));
        Ok(())
    }
}

pub struct RecordingNotifier {
    pub alerts: Arc<Mutex<Vec<Alert>>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> String {
        "recording".to_string()
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

pub fn service(name: &str) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        image: format!("{name}:latest"),
        compose_file: format!("/srv/{name}/compose.yaml"),
        compose_project: name.to_string(),
        container_name: String::new(),
        auto_update: true,
        auto_heal: false,
        health_grace: 60,
        heal_cooldown: 300,
        heal_max_restarts: 3,
    }
}

pub fn running_details(id: &str, name: &str) -> ContainerDetails {
    ContainerDetails {
        id: id.to_string(),
        name: name.to_string(),
        image_id: format!("sha256:image-of-{id}"),
        running: true,
        health: None,
    }
}

pub fn health_details(id: &str, name: &str, status: HealthState, output: &str) -> ContainerDetails {
    ContainerDetails {
        id: id.to_string(),
        name: name.to_string(),
        image_id: format!("sha256:image-of-{id}"),
        running: true,
        health: Some(ContainerHealth {
            status,
            last_output: output.to_string(),
        }),
    }
}

pub fn event(action: &str, container_id: &str, name: &str, project: &str) -> EngineEvent {
    let mut attributes = HashMap::new();
    if !name.is_empty() {
        attributes.insert("name".to_string(), name.to_string());
    }
    if !project.is_empty() {
        attributes.insert(COMPOSE_PROJECT_LABEL.to_string(), project.to_string());
    }
    EngineEvent {
        action: action.to_string(),
        container_id: container_id.to_string(),
        attributes,
    }
}

/// Spins on virtual time until the predicate holds.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..600 {
        if predicate() {
            // One extra yield so detached tasks finish their tail work.
            tokio::task::yield_now().await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    panic!("condition not reached in time");
}
