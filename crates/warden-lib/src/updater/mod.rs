//! Registry polling, guarded deploys and rollback.
//!
//! Every poll cycle compares the remote manifest digest of each auto-update
//! service against what is deployed locally. A digest change triggers a
//! compose deploy with a bounded health-verification window; failed
//! verification rolls back to the previous image and blocks the bad digest
//! until the registry moves on or an operator unblocks it.

mod state;

#[cfg(test)]
mod tests;

pub use state::DeployWatch;

pub(crate) use state::{DeployGuard, DeployState};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compose::ComposeRunner;
use crate::engine::{ContainerEngine, HealthState};
use crate::metrics::MetricsSink;
use crate::models::ServiceSpec;
use crate::notify::{Alert, AlertEvent, AlertLevel, Dispatcher};
use crate::reference::{image_name, image_tag, registry_host, short_digest};
use crate::registry::ImageRegistry;

/// Cadence of health polls during the verification window.
const VERIFY_POLL: Duration = Duration::from_secs(5);

/// Tag under which the previous image is kept for rollback.
const ROLLBACK_TAG: &str = "rollback";

/// Updater settings from the top-level configuration.
#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    /// Registry base URL, e.g. `http://localhost:5000`.
    pub registry_url: String,
    /// Interval between poll cycles.
    pub poll_interval: Duration,
}

/// The registry poll loop and deploy pipeline.
///
/// Cheap to clone; clones share all state. Detached verification tasks run
/// on clones of the updater that spawned them.
#[derive(Clone)]
pub struct Updater {
    settings: Arc<UpdaterSettings>,
    services: Arc<Vec<ServiceSpec>>,
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<dyn ImageRegistry>,
    compose: Arc<dyn ComposeRunner>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<MetricsSink>,
    state: Arc<DeployState>,
}

impl Updater {
    pub fn new(
        settings: UpdaterSettings,
        services: Vec<ServiceSpec>,
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<dyn ImageRegistry>,
        compose: Arc<dyn ComposeRunner>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            services: Arc::new(services),
            engine,
            registry,
            compose,
            dispatcher,
            metrics,
            state: Arc::new(DeployState::default()),
        }
    }

    /// Runs the poll loop: one immediate cycle, then one per interval.
    /// Returns when the token is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            interval_secs = self.settings.poll_interval.as_secs(),
            "starting registry poller"
        );
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.poll_all(&token).await,
            }
        }
    }

    /// One full poll cycle across all auto-update services. Per-service
    /// errors are logged and never abort the cycle.
    pub async fn poll_all(&self, token: &CancellationToken) {
        self.metrics.record_poll();
        for svc in self.services.iter().filter(|svc| svc.auto_update) {
            if token.is_cancelled() {
                return;
            }
            if let Err(error) = self.check_and_update(token, svc).await {
                warn!(service = %svc.name, error = %error, "update check failed");
            }
        }
    }

    /// The per-service poll step: digest compare plus deploy when the remote
    /// has advanced. Also invoked directly by the control API.
    pub async fn check_and_update(
        &self,
        token: &CancellationToken,
        svc: &ServiceSpec,
    ) -> Result<()> {
        let remote_digest = self
            .registry
            .remote_digest(&svc.image)
            .await
            .context("remote digest")?;

        // A digest that caused a rollback is skipped silently until the
        // registry serves something else.
        if let Some(blocked) = self.state.blocked_digest(&svc.name) {
            if blocked == remote_digest {
                return Ok(());
            }
            info!(service = %svc.name, "blocked digest changed upstream, unblocking");
            self.state.clear_blocked(&svc.name);
            self.metrics.set_blocked(&svc.name, false);
        }

        // Same rules for the not-found suppression.
        if let Some(suppressed) = self.state.not_found_digest(&svc.name) {
            if suppressed == remote_digest {
                return Ok(());
            }
            info!(
                service = %svc.name,
                "registry digest changed since not-found suppression, retrying"
            );
            self.state.clear_not_found(&svc.name);
        }

        let repo = format!(
            "{}/{}",
            registry_host(&self.settings.registry_url),
            image_name(&svc.image)
        );

        let Some(local_digest) = self.resolve_local_digest(svc, &repo).await else {
            warn!(
                service = %svc.name,
                "no local digest resolved, suppressing until registry digest changes"
            );
            self.state.set_not_found(&svc.name, &remote_digest);
            self.dispatcher
                .send(Alert::new(
                    &svc.name,
                    AlertEvent::NotFound,
                    AlertLevel::Warning,
                    "Image not found locally. Verify compose file image field matches \
                     registry. Suppressing until registry digest changes.",
                ))
                .await;
            return Ok(());
        };

        if local_digest == remote_digest {
            return Ok(());
        }

        info!(
            service = %svc.name,
            old = %short_digest(&local_digest),
            new = %short_digest(&remote_digest),
            "digest changed"
        );
        self.deploy(token, svc, &local_digest, &remote_digest, &repo)
            .await
    }

    /// Resolves the locally deployed digest with a two-strategy fallback:
    /// inspect the image by constructed reference, then resolve through the
    /// running container's image ID.
    async fn resolve_local_digest(&self, svc: &ServiceSpec, repo: &str) -> Option<String> {
        let full_image = format!("{repo}:{}", image_tag(&svc.image));

        match self.engine.inspect_image(&full_image).await {
            Ok(image) => {
                if let Some(digest) = image.digest_for(repo) {
                    return Some(digest);
                }
                debug!(
                    service = %svc.name,
                    image = %full_image,
                    "image found by reference but repo digests do not match"
                );
            }
            Err(error) => {
                debug!(
                    service = %svc.name,
                    image = %full_image,
                    error = %error,
                    "image inspect by reference failed"
                );
            }
        }

        let container_id = self.first_container(&svc.compose_project).await?;
        let details = match self.engine.inspect_container(&container_id).await {
            Ok(details) => details,
            Err(error) => {
                debug!(
                    service = %svc.name,
                    error = %error,
                    "container inspect failed during fallback"
                );
                return None;
            }
        };

        match self.engine.inspect_image(&details.image_id).await {
            Ok(image) => {
                let digest = image.digest_for(repo);
                if digest.is_some() {
                    debug!(service = %svc.name, "resolved digest via container fallback");
                }
                digest
            }
            Err(error) => {
                debug!(
                    service = %svc.name,
                    image_id = %details.image_id,
                    error = %error,
                    "image inspect by ID failed"
                );
                None
            }
        }
    }

    async fn deploy(
        &self,
        token: &CancellationToken,
        svc: &ServiceSpec,
        old_digest: &str,
        new_digest: &str,
        repo: &str,
    ) -> Result<()> {
        if !self.state.try_start_deploy(&svc.name) {
            info!(service = %svc.name, "deploy already in progress, skipping");
            return Ok(());
        }
        // From here on the slot is released by the guard, whichever way the
        // deploy or its verification task exits.
        let guard = DeployGuard::new(self.state.clone(), svc.name.clone());

        let full_image = format!("{repo}:{}", image_tag(&svc.image));

        if !old_digest.is_empty() {
            if let Err(error) = self.engine.tag_image(&full_image, repo, ROLLBACK_TAG).await {
                // The deploy proceeds; rollback just won't be available.
                warn!(service = %svc.name, error = %error, "failed to tag rollback image");
            }
        }

        info!(service = %svc.name, "pulling and deploying");
        self.compose
            .pull(token, &svc.compose_file, &svc.compose_project)
            .await
            .context("compose pull")?;
        self.compose
            .up(token, &svc.compose_file, &svc.compose_project)
            .await
            .context("compose up")?;

        let updater = self.clone();
        let svc = svc.clone();
        let old_digest = old_digest.to_string();
        let new_digest = new_digest.to_string();
        let repo = repo.to_string();
        let token = token.clone();
        tokio::spawn(async move {
            updater
                .verify_after_deploy(guard, token, svc, old_digest, new_digest, repo)
                .await;
        });
        Ok(())
    }

    /// Polls the new container's health until it settles or the grace window
    /// expires. Holds the deploy guard for the whole window.
    async fn verify_after_deploy(
        &self,
        guard: DeployGuard,
        token: CancellationToken,
        svc: ServiceSpec,
        old_digest: String,
        new_digest: String,
        repo: String,
    ) {
        let _guard = guard;

        let deadline = Instant::now() + Duration::from_secs(svc.health_grace);
        info!(
            service = %svc.name,
            grace_secs = svc.health_grace,
            "verifying deploy health"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(VERIFY_POLL) => {}
            }

            let Some(container_id) = self.first_container(&svc.compose_project).await else {
                if Instant::now() > deadline {
                    warn!(service = %svc.name, "container not found after grace period");
                    self.rollback(
                        &token,
                        &svc,
                        &old_digest,
                        &new_digest,
                        &repo,
                        "container not found after deploy",
                    )
                    .await;
                    return;
                }
                continue; // Compose may still be creating it.
            };

            let details = match self.engine.inspect_container(&container_id).await {
                Ok(details) => details,
                Err(error) => {
                    warn!(
                        service = %svc.name,
                        error = %error,
                        "inspect failed during health poll"
                    );
                    if Instant::now() > deadline {
                        self.rollback(
                            &token,
                            &svc,
                            &old_digest,
                            &new_digest,
                            &repo,
                            &format!("inspect failed: {error}"),
                        )
                        .await;
                        return;
                    }
                    continue;
                }
            };

            // No health check configured: running is as good as it gets.
            let Some(health) = details.health.clone() else {
                if details.running {
                    self.on_deploy_success(&svc, &old_digest, &new_digest, &details.name, &repo)
                        .await;
                    return;
                }
                if Instant::now() > deadline {
                    self.rollback(
                        &token,
                        &svc,
                        &old_digest,
                        &new_digest,
                        &repo,
                        "container not running",
                    )
                    .await;
                    return;
                }
                continue;
            };

            match health.status {
                HealthState::Healthy => {
                    self.on_deploy_success(&svc, &old_digest, &new_digest, &details.name, &repo)
                        .await;
                    return;
                }
                HealthState::Unhealthy => {
                    // Fail fast; waiting out the grace window cannot help.
                    warn!(service = %svc.name, "unhealthy, rolling back immediately");
                    self.rollback(
                        &token,
                        &svc,
                        &old_digest,
                        &new_digest,
                        &repo,
                        &health.last_output,
                    )
                    .await;
                    return;
                }
                _ => {
                    if Instant::now() > deadline {
                        warn!(
                            service = %svc.name,
                            status = %health.status,
                            "still not healthy after grace period"
                        );
                        self.rollback(
                            &token,
                            &svc,
                            &old_digest,
                            &new_digest,
                            &repo,
                            &health.last_output,
                        )
                        .await;
                        return;
                    }
                }
            }
        }
    }

    async fn on_deploy_success(
        &self,
        svc: &ServiceSpec,
        old_digest: &str,
        new_digest: &str,
        container_name: &str,
        repo: &str,
    ) {
        info!(service = %svc.name, "deployed successfully");
        self.metrics.inc_updates(&svc.name);
        self.metrics.set_healthy(&svc.name, true);
        self.dispatcher
            .send(
                Alert::new(
                    &svc.name,
                    AlertEvent::Updated,
                    AlertLevel::Info,
                    "Deployed new image successfully.",
                )
                .digests(old_digest, new_digest)
                .container(container_name),
            )
            .await;
        self.cleanup_rollback(repo).await;
    }

    async fn rollback(
        &self,
        token: &CancellationToken,
        svc: &ServiceSpec,
        old_digest: &str,
        new_digest: &str,
        repo: &str,
        reason: &str,
    ) {
        warn!(service = %svc.name, reason = %reason, "rolling back");
        self.metrics.inc_rollbacks(&svc.name);
        self.metrics.set_healthy(&svc.name, false);

        // Block the digest before anything else so no poll can retry it,
        // however the rest of the rollback goes.
        self.state.block(&svc.name, new_digest);
        self.metrics.set_blocked(&svc.name, true);
        info!(
            service = %svc.name,
            digest = %short_digest(new_digest),
            "blocked digest"
        );

        let rollback_image = format!("{repo}:{ROLLBACK_TAG}");
        let tag = image_tag(&svc.image);

        if let Err(error) = self.engine.tag_image(&rollback_image, repo, tag).await {
            warn!(service = %svc.name, error = %error, "rollback retag failed");
            self.metrics.inc_failures(&svc.name);
            self.dispatcher
                .send(
                    Alert::new(
                        &svc.name,
                        AlertEvent::RolledBack,
                        AlertLevel::Critical,
                        "Rollback failed: could not retag image.",
                    )
                    .reason(reason)
                    .digests(old_digest, new_digest),
                )
                .await;
            return;
        }

        if let Err(error) = self
            .compose
            .up(token, &svc.compose_file, &svc.compose_project)
            .await
        {
            warn!(service = %svc.name, error = %error, "rollback compose up failed");
            self.metrics.inc_failures(&svc.name);
            self.dispatcher
                .send(
                    Alert::new(
                        &svc.name,
                        AlertEvent::RolledBack,
                        AlertLevel::Critical,
                        "Rollback compose up failed.",
                    )
                    .reason(reason)
                    .digests(old_digest, new_digest),
                )
                .await;
            return;
        }

        self.dispatcher
            .send(
                Alert::new(
                    &svc.name,
                    AlertEvent::RolledBack,
                    AlertLevel::Warning,
                    "Rolled back to previous image.",
                )
                .reason(reason)
                .digests(old_digest, new_digest),
            )
            .await;

        self.cleanup_rollback(repo).await;
    }

    /// Drops the `:rollback` tag; a missing tag is not an error.
    async fn cleanup_rollback(&self, repo: &str) {
        let _ = self
            .engine
            .remove_image(&format!("{repo}:{ROLLBACK_TAG}"))
            .await;
    }

    async fn first_container(&self, project: &str) -> Option<String> {
        match self.engine.containers_for_project(project).await {
            Ok(ids) => ids.into_iter().next(),
            Err(error) => {
                warn!(project = %project, error = %error, "list containers failed");
                None
            }
        }
    }

    /// True while a deploy (including its verification window) is in flight.
    pub fn is_deploying(&self, service: &str) -> bool {
        self.state.is_deploying(service)
    }

    /// Snapshot copy of the blocked service → digest map.
    pub fn blocked_digests(&self) -> HashMap<String, String> {
        self.state.blocked_snapshot()
    }

    /// Snapshot copy of the not-found service → digest map.
    pub fn not_found_services(&self) -> HashMap<String, String> {
        self.state.not_found_snapshot()
    }

    /// Operator unblock; returns whether the service had a blocked digest.
    pub fn unblock_service(&self, service: &str) -> bool {
        let existed = self.state.clear_blocked(service);
        if existed {
            self.metrics.set_blocked(service, false);
            info!(service = %service, "manually unblocked");
        }
        existed
    }

    /// Read-only deploy predicate for the healer.
    pub fn watch(&self) -> DeployWatch {
        DeployWatch::new(self.state.clone())
    }

    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }
}
