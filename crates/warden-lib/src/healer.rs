//! Event-driven container healing.
//!
//! Listens on the engine event stream and reacts to health transitions and
//! unexpected exits: auto-heal services get restarted under a per-container
//! cooldown and a bounded retry budget, everything else only produces
//! alerts. The healer defers to the updater whenever a deploy window is
//! open for the service.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, EngineEvent, HealthState};
use crate::metrics::MetricsSink;
use crate::models::ServiceSpec;
use crate::notify::{Alert, AlertEvent, AlertLevel, Dispatcher};
use crate::updater::DeployWatch;

/// Pause before reconnecting a dropped event stream.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// How long a restarted container gets before its health is re-checked.
const RESTART_VERIFY_DELAY: Duration = Duration::from_secs(30);

/// Graceful-stop timeout handed to the engine on restart.
const RESTART_STOP_TIMEOUT: i64 = 10;

/// The health event loop.
///
/// Cheap to clone; clones share all state. Verify-after-restart tasks run on
/// clones of the healer that spawned them.
#[derive(Clone)]
pub struct Healer {
    services: Arc<Vec<ServiceSpec>>,
    engine: Arc<dyn ContainerEngine>,
    dispatcher: Arc<Dispatcher>,
    watch: DeployWatch,
    metrics: Arc<MetricsSink>,
    cooldowns: Arc<Mutex<HashMap<String, Instant>>>,
    degraded: Arc<Mutex<HashSet<String>>>,
    restart_counts: Arc<Mutex<HashMap<String, u32>>>,
}

impl Healer {
    pub fn new(
        services: Vec<ServiceSpec>,
        engine: Arc<dyn ContainerEngine>,
        dispatcher: Arc<Dispatcher>,
        watch: DeployWatch,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        Self {
            services: Arc::new(services),
            engine,
            dispatcher,
            watch,
            metrics,
            cooldowns: Arc::new(Mutex::new(HashMap::new())),
            degraded: Arc::new(Mutex::new(HashSet::new())),
            restart_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consumes the engine event stream, reconnecting with a fixed back-off
    /// on any transport failure. Returns when the token is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        info!("listening for container engine events");
        loop {
            if token.is_cancelled() {
                return;
            }

            let mut stream = self.engine.events();
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    next = stream.next() => match next {
                        Some(Ok(event)) => self.handle_event(&token, event).await,
                        Some(Err(error)) => {
                            warn!(error = %error, "event stream error");
                            break;
                        }
                        None => {
                            warn!("event stream closed");
                            break;
                        }
                    }
                }
            }
            drop(stream);

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
    }

    async fn handle_event(&self, token: &CancellationToken, event: EngineEvent) {
        let Some(svc) = self.service_for(&event) else {
            return;
        };

        if event.action.starts_with("health_status: unhealthy") {
            self.handle_unhealthy(token, &svc, &event).await;
        } else if event.action.starts_with("health_status: healthy") {
            self.handle_healthy(&svc, &event).await;
        } else if event.action == "die" {
            self.handle_died(&svc, &event).await;
        }
    }

    /// First service matching the event's compose project label or its
    /// container name. Unmatched events are dropped.
    fn service_for(&self, event: &EngineEvent) -> Option<ServiceSpec> {
        let project = event.compose_project();
        let name = event.container_name();
        self.services
            .iter()
            .find(|svc| {
                (!project.is_empty() && svc.compose_project == project)
                    || (!name.is_empty() && svc.container_name.trim_start_matches('/') == name)
            })
            .cloned()
    }

    async fn handle_unhealthy(
        &self,
        token: &CancellationToken,
        svc: &ServiceSpec,
        event: &EngineEvent,
    ) {
        let container_name = event.container_name().to_string();

        // The updater's verify-after-deploy owns this window.
        if self.watch.is_deploying(&svc.name) {
            debug!(service = %svc.name, "unhealthy during deploy window, deferring to updater");
            return;
        }

        let reason = match self.engine.inspect_container(&event.container_id).await {
            Ok(details) => details
                .health
                .map(|health| health.last_output)
                .unwrap_or_default(),
            Err(_) => String::new(),
        };

        warn!(service = %svc.name, reason = %reason, "container unhealthy");
        self.metrics.set_healthy(&svc.name, false);
        self.degraded.lock().unwrap().insert(svc.name.clone());

        if !svc.auto_heal {
            self.dispatcher
                .send(
                    Alert::new(
                        &svc.name,
                        AlertEvent::Unhealthy,
                        AlertLevel::Warning,
                        "Container is unhealthy.",
                    )
                    .reason(&reason)
                    .container(&container_name),
                )
                .await;
            return;
        }

        let count = self
            .restart_counts
            .lock()
            .unwrap()
            .get(&svc.name)
            .copied()
            .unwrap_or(0);
        if count >= svc.heal_max_restarts {
            warn!(
                service = %svc.name,
                max_restarts = svc.heal_max_restarts,
                "max restarts reached, giving up"
            );
            return;
        }

        if self.in_cooldown(&container_name) {
            debug!(service = %svc.name, "in cooldown, skipping restart");
            return;
        }

        info!(service = %svc.name, "restarting container");
        if let Err(error) = self
            .engine
            .restart_container(&event.container_id, RESTART_STOP_TIMEOUT)
            .await
        {
            warn!(service = %svc.name, error = %error, "restart failed");
            self.metrics.inc_failures(&svc.name);
            self.dispatcher
                .send(
                    Alert::new(
                        &svc.name,
                        AlertEvent::Critical,
                        AlertLevel::Critical,
                        "Failed to restart unhealthy container.",
                    )
                    .reason(&reason)
                    .container(&container_name),
                )
                .await;
            return;
        }

        self.cooldowns.lock().unwrap().insert(
            container_name.clone(),
            Instant::now() + Duration::from_secs(svc.heal_cooldown),
        );

        let healer = self.clone();
        let svc = svc.clone();
        let container_id = event.container_id.clone();
        let token = token.clone();
        tokio::spawn(async move {
            healer
                .verify_after_restart(token, svc, container_name, container_id, reason)
                .await;
        });
    }

    /// Re-checks a restarted container after a settling delay and escalates
    /// when the restart did not help.
    async fn verify_after_restart(
        &self,
        token: CancellationToken,
        svc: ServiceSpec,
        container_name: String,
        container_id: String,
        reason: String,
    ) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(RESTART_VERIFY_DELAY) => {}
        }

        let details = match self.engine.inspect_container(&container_id).await {
            Ok(details) => details,
            Err(error) => {
                warn!(service = %svc.name, error = %error, "could not verify after restart");
                return;
            }
        };

        if let Some(health) = &details.health {
            if health.status == HealthState::Unhealthy {
                warn!(service = %svc.name, "still unhealthy after restart");
                self.metrics.inc_failures(&svc.name);

                let count = {
                    let mut counts = self.restart_counts.lock().unwrap();
                    let count = counts.entry(svc.name.clone()).or_insert(0);
                    *count += 1;
                    *count
                };

                let message = if count >= svc.heal_max_restarts {
                    warn!(
                        service = %svc.name,
                        count = count,
                        "giving up after consecutive failed restarts"
                    );
                    format!(
                        "Giving up after {count} consecutive failed restarts. \
                         Manual intervention required."
                    )
                } else {
                    format!(
                        "Container still unhealthy after restart (attempt {count}/{}).",
                        svc.heal_max_restarts
                    )
                };
                self.dispatcher
                    .send(
                        Alert::new(&svc.name, AlertEvent::Critical, AlertLevel::Critical, message)
                            .reason(health.last_output.clone())
                            .container(&container_name),
                    )
                    .await;
                return;
            }
        }

        self.metrics.inc_restarts(&svc.name);
        self.metrics.set_healthy(&svc.name, true);
        self.dispatcher
            .send(
                Alert::new(
                    &svc.name,
                    AlertEvent::Restarted,
                    AlertLevel::Warning,
                    "Restarted unhealthy container successfully.",
                )
                .reason(reason)
                .container(&container_name),
            )
            .await;
    }

    async fn handle_healthy(&self, svc: &ServiceSpec, event: &EngineEvent) {
        let container_name = event.container_name();

        // Recovery noise during a deploy belongs to the verification task.
        if self.watch.is_deploying(&svc.name) {
            return;
        }

        let was_cooling = self
            .cooldowns
            .lock()
            .unwrap()
            .contains_key(container_name);
        let was_degraded = self.degraded.lock().unwrap().contains(&svc.name);
        if !was_cooling && !was_degraded {
            return; // Routine health-check noise.
        }

        info!(service = %svc.name, "recovered");
        self.metrics.set_healthy(&svc.name, true);
        self.degraded.lock().unwrap().remove(&svc.name);
        self.restart_counts.lock().unwrap().remove(&svc.name);
        self.dispatcher
            .send(
                Alert::new(
                    &svc.name,
                    AlertEvent::Healthy,
                    AlertLevel::Info,
                    "Container recovered and is healthy.",
                )
                .container(container_name),
            )
            .await;
    }

    async fn handle_died(&self, svc: &ServiceSpec, event: &EngineEvent) {
        // Containers die as part of every compose recreate.
        if self.watch.is_deploying(&svc.name) {
            return;
        }

        warn!(service = %svc.name, "container exited unexpectedly");
        self.metrics.set_healthy(&svc.name, false);
        self.degraded.lock().unwrap().insert(svc.name.clone());
        self.dispatcher
            .send(
                Alert::new(
                    &svc.name,
                    AlertEvent::Died,
                    AlertLevel::Critical,
                    "Container exited unexpectedly.",
                )
                .container(event.container_name()),
            )
            .await;
    }

    fn in_cooldown(&self, container_name: &str) -> bool {
        self.cooldowns
            .lock()
            .unwrap()
            .get(container_name)
            .is_some_and(|deadline| Instant::now() < *deadline)
    }
}
