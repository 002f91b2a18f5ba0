use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::testutil::{
    health_details, running_details, service, wait_until, MockCompose, MockEngine, MockRegistry,
    RecordingNotifier,
};

const REPO: &str = "localhost:5000/app";

fn build_updater(
    engine: Arc<MockEngine>,
    registry: Arc<MockRegistry>,
    compose: Arc<MockCompose>,
    services: Vec<ServiceSpec>,
) -> (Updater, Arc<Mutex<Vec<Alert>>>, Arc<MetricsSink>) {
    let alerts = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = Arc::new(Dispatcher::new(vec![Box::new(RecordingNotifier {
        alerts: alerts.clone(),
    })]));
    let metrics = Arc::new(MetricsSink::new());
    let updater = Updater::new(
        UpdaterSettings {
            registry_url: "http://localhost:5000".to_string(),
            poll_interval: Duration::from_secs(300),
        },
        services,
        engine,
        registry,
        compose,
        dispatcher,
        metrics.clone(),
    );
    (updater, alerts, metrics)
}

fn local_image(digest: &str) -> crate::engine::ImageDetails {
    crate::engine::ImageDetails {
        id: "sha256:local-image".to_string(),
        repo_digests: vec![format!("{REPO}@{digest}")],
    }
}

async fn wait_for_deploy_to_finish(updater: &Updater, service: &str) {
    wait_until(|| !updater.is_deploying(service)).await;
}

#[tokio::test(start_paused = true)]
async fn clean_update_deploys_and_reports() {
    let engine = Arc::new(MockEngine::default());
    engine.put_image(&format!("{REPO}:latest"), local_image("sha256:aaa"));
    engine.add_container("app", "c1");
    engine.script_details("c1", vec![health_details("c1", "app-1", HealthState::Healthy, "")]);

    let registry = Arc::new(MockRegistry::with_digest("sha256:bbb"));
    let compose = Arc::new(MockCompose::default());
    let (updater, alerts, metrics) =
        build_updater(engine.clone(), registry, compose.clone(), vec![service("app")]);

    let svc = updater.services()[0].clone();
    let token = CancellationToken::new();
    updater.check_and_update(&token, &svc).await.unwrap();
    assert!(updater.is_deploying("app"));
    wait_for_deploy_to_finish(&updater, "app").await;

    assert_eq!(
        compose.calls.lock().unwrap().as_slice(),
        ["pull app", "up app"]
    );
    // Current image was kept under the rollback tag before the deploy.
    assert!(engine.tags.lock().unwrap().contains(&(
        format!("{REPO}:latest"),
        REPO.to_string(),
        "rollback".to_string()
    )));
    // ... and discarded again after success.
    assert!(engine
        .removed
        .lock()
        .unwrap()
        .contains(&format!("{REPO}:rollback")));

    let alerts = alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].event, AlertEvent::Updated);
    assert_eq!(alerts[0].level, AlertLevel::Info);
    assert_eq!(alerts[0].old_digest.as_deref(), Some("sha256:aaa"));
    assert_eq!(alerts[0].new_digest.as_deref(), Some("sha256:bbb"));
    assert_eq!(alerts[0].container.as_deref(), Some("app-1"));

    let text = metrics.export();
    assert!(text.contains(r#"warden_updates_total{service="app"} 1"#));
    assert!(text.contains(r#"warden_service_healthy{service="app"} 1"#));
    assert!(updater.blocked_digests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unhealthy_deploy_rolls_back_and_blocks() {
    let engine = Arc::new(MockEngine::default());
    engine.put_image(&format!("{REPO}:latest"), local_image("sha256:aaa"));
    engine.add_container("app", "c1");
    engine.script_details(
        "c1",
        vec![health_details(
            "c1",
            "app-1",
            HealthState::Unhealthy,
            "probe failed",
        )],
    );

    let registry = Arc::new(MockRegistry::with_digest("sha256:ccc"));
    let compose = Arc::new(MockCompose::default());
    let (updater, alerts, metrics) =
        build_updater(engine.clone(), registry, compose.clone(), vec![service("app")]);

    let svc = updater.services()[0].clone();
    let token = CancellationToken::new();
    updater.check_and_update(&token, &svc).await.unwrap();
    wait_for_deploy_to_finish(&updater, "app").await;

    // Deploy pull+up, then the rollback up.
    assert_eq!(
        compose.calls.lock().unwrap().as_slice(),
        ["pull app", "up app", "up app"]
    );
    // The rollback image was retagged back onto the service tag.
    assert!(engine.tags.lock().unwrap().contains(&(
        format!("{REPO}:rollback"),
        REPO.to_string(),
        "latest".to_string()
    )));

    assert_eq!(
        updater.blocked_digests().get("app").map(String::as_str),
        Some("sha256:ccc")
    );

    let alerts = alerts.lock().unwrap();
    let last = alerts.last().unwrap();
    assert_eq!(last.event, AlertEvent::RolledBack);
    assert_eq!(last.level, AlertLevel::Warning);
    assert_eq!(last.reason.as_deref(), Some("probe failed"));

    let text = metrics.export();
    assert!(text.contains(r#"warden_rollbacks_total{service="app"} 1"#));
    assert!(text.contains(r#"warden_service_healthy{service="app"} 0"#));
    assert!(text.contains(r#"warden_service_blocked{service="app"} 1"#));
}

#[tokio::test(start_paused = true)]
async fn blocked_digest_suppresses_redeploy() {
    let engine = Arc::new(MockEngine::default());
    engine.put_image(&format!("{REPO}:latest"), local_image("sha256:aaa"));
    engine.add_container("app", "c1");
    engine.script_details(
        "c1",
        vec![health_details("c1", "app-1", HealthState::Unhealthy, "boom")],
    );

    let registry = Arc::new(MockRegistry::with_digest("sha256:ccc"));
    let compose = Arc::new(MockCompose::default());
    let (updater, alerts, _metrics) =
        build_updater(engine.clone(), registry, compose.clone(), vec![service("app")]);

    let svc = updater.services()[0].clone();
    let token = CancellationToken::new();
    updater.check_and_update(&token, &svc).await.unwrap();
    wait_for_deploy_to_finish(&updater, "app").await;

    let calls_after_rollback = compose.calls.lock().unwrap().len();
    let alerts_after_rollback = alerts.lock().unwrap().len();

    // Repeated polls with the same bad digest are silent no-ops.
    updater.check_and_update(&token, &svc).await.unwrap();
    updater.check_and_update(&token, &svc).await.unwrap();

    assert_eq!(compose.calls.lock().unwrap().len(), calls_after_rollback);
    assert_eq!(alerts.lock().unwrap().len(), alerts_after_rollback);
}

#[tokio::test(start_paused = true)]
async fn pushed_fix_clears_block_and_redeploys() {
    let engine = Arc::new(MockEngine::default());
    engine.put_image(&format!("{REPO}:latest"), local_image("sha256:aaa"));
    engine.add_container("app", "c1");
    engine.script_details(
        "c1",
        vec![health_details("c1", "app-1", HealthState::Unhealthy, "boom")],
    );

    let registry = Arc::new(MockRegistry::with_digest("sha256:ccc"));
    let compose = Arc::new(MockCompose::default());
    let (updater, _alerts, metrics) =
        build_updater(engine.clone(), registry.clone(), compose.clone(), vec![service("app")]);

    let svc = updater.services()[0].clone();
    let token = CancellationToken::new();
    updater.check_and_update(&token, &svc).await.unwrap();
    wait_for_deploy_to_finish(&updater, "app").await;
    assert!(updater.blocked_digests().contains_key("app"));

    // A fix lands in the registry; the next poll unblocks and deploys it.
    registry.set_digest("sha256:ddd");
    engine.script_details("c1", vec![health_details("c1", "app-1", HealthState::Healthy, "")]);

    updater.check_and_update(&token, &svc).await.unwrap();
    wait_for_deploy_to_finish(&updater, "app").await;

    assert!(updater.blocked_digests().is_empty());
    let text = metrics.export();
    assert!(text.contains(r#"warden_updates_total{service="app"} 1"#));
    assert!(text.contains(r#"warden_service_blocked{service="app"} 0"#));
}

#[tokio::test(start_paused = true)]
async fn operator_unblock_reenables_deploy() {
    let engine = Arc::new(MockEngine::default());
    engine.put_image(&format!("{REPO}:latest"), local_image("sha256:aaa"));
    engine.add_container("app", "c1");
    engine.script_details(
        "c1",
        vec![health_details("c1", "app-1", HealthState::Unhealthy, "boom")],
    );

    let registry = Arc::new(MockRegistry::with_digest("sha256:ccc"));
    let compose = Arc::new(MockCompose::default());
    let (updater, _alerts, metrics) =
        build_updater(engine.clone(), registry, compose.clone(), vec![service("app")]);

    let svc = updater.services()[0].clone();
    let token = CancellationToken::new();
    updater.check_and_update(&token, &svc).await.unwrap();
    wait_for_deploy_to_finish(&updater, "app").await;

    assert!(updater.unblock_service("app"));
    assert!(!updater.unblock_service("app"));

    // The previously blocked digest deploys again after the unblock.
    engine.script_details("c1", vec![health_details("c1", "app-1", HealthState::Healthy, "")]);
    updater.check_and_update(&token, &svc).await.unwrap();
    wait_for_deploy_to_finish(&updater, "app").await;

    assert!(metrics
        .export()
        .contains(r#"warden_updates_total{service="app"} 1"#));
}

#[tokio::test(start_paused = true)]
async fn unresolvable_local_digest_enters_suppression() {
    // No local image and no running container: both strategies fail.
    let engine = Arc::new(MockEngine::default());
    let registry = Arc::new(MockRegistry::with_digest("sha256:eee"));
    let compose = Arc::new(MockCompose::default());
    let (updater, alerts, _metrics) =
        build_updater(engine.clone(), registry.clone(), compose.clone(), vec![service("app")]);

    let svc = updater.services()[0].clone();
    let token = CancellationToken::new();
    updater.check_and_update(&token, &svc).await.unwrap();

    assert_eq!(
        updater.not_found_services().get("app").map(String::as_str),
        Some("sha256:eee")
    );
    {
        let alerts = alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event, AlertEvent::NotFound);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
    }

    // Further polls are silent while the remote digest is unchanged.
    updater.check_and_update(&token, &svc).await.unwrap();
    assert_eq!(alerts.lock().unwrap().len(), 1);

    // Once the registry moves on, the suppression is lifted.
    registry.set_digest("sha256:fff");
    engine.put_image(&format!("{REPO}:latest"), local_image("sha256:fff"));
    updater.check_and_update(&token, &svc).await.unwrap();

    assert!(updater.not_found_services().is_empty());
    assert!(compose.calls.lock().unwrap().is_empty());
    assert_eq!(alerts.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn identical_digests_are_a_no_op() {
    let engine = Arc::new(MockEngine::default());
    engine.put_image(&format!("{REPO}:latest"), local_image("sha256:aaa"));

    let registry = Arc::new(MockRegistry::with_digest("sha256:aaa"));
    let compose = Arc::new(MockCompose::default());
    let (updater, alerts, metrics) =
        build_updater(engine, registry, compose.clone(), vec![service("app")]);

    let token = CancellationToken::new();
    updater.poll_all(&token).await;
    updater.poll_all(&token).await;

    assert!(compose.calls.lock().unwrap().is_empty());
    assert!(alerts.lock().unwrap().is_empty());
    assert!(metrics.export().contains("warden_poll_cycles_total 2"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_deploy_is_skipped() {
    let engine = Arc::new(MockEngine::default());
    engine.put_image(&format!("{REPO}:latest"), local_image("sha256:aaa"));

    let registry = Arc::new(MockRegistry::with_digest("sha256:bbb"));
    let compose = Arc::new(MockCompose::default());
    let (updater, _alerts, _metrics) =
        build_updater(engine, registry, compose.clone(), vec![service("app")]);

    // Another deploy already holds the slot.
    assert!(updater.state.try_start_deploy("app"));

    let svc = updater.services()[0].clone();
    let token = CancellationToken::new();
    updater.check_and_update(&token, &svc).await.unwrap();

    assert!(compose.calls.lock().unwrap().is_empty());
    assert!(updater.is_deploying("app"));
}

#[tokio::test(start_paused = true)]
async fn fallback_resolves_digest_through_running_container() {
    let engine = Arc::new(MockEngine::default());
    // No image under the constructed reference; the container's image ID
    // carries the repo digest instead.
    engine.add_container("app", "c1");
    engine.script_details("c1", vec![running_details("c1", "app-1")]);
    engine.put_image("sha256:image-of-c1", local_image("sha256:aaa"));

    let registry = Arc::new(MockRegistry::with_digest("sha256:aaa"));
    let compose = Arc::new(MockCompose::default());
    let (updater, alerts, _metrics) =
        build_updater(engine, registry, compose.clone(), vec![service("app")]);

    let svc = updater.services()[0].clone();
    let token = CancellationToken::new();
    updater.check_and_update(&token, &svc).await.unwrap();

    // Local digest resolved and matched; nothing to deploy, no suppression.
    assert!(compose.calls.lock().unwrap().is_empty());
    assert!(alerts.lock().unwrap().is_empty());
    assert!(updater.not_found_services().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stuck_in_starting_rolls_back_at_deadline() {
    let engine = Arc::new(MockEngine::default());
    engine.put_image(&format!("{REPO}:latest"), local_image("sha256:aaa"));
    engine.add_container("app", "c1");
    engine.script_details(
        "c1",
        vec![health_details(
            "c1",
            "app-1",
            HealthState::Starting,
            "warming up",
        )],
    );

    let registry = Arc::new(MockRegistry::with_digest("sha256:bbb"));
    let compose = Arc::new(MockCompose::default());
    let mut svc = service("app");
    svc.health_grace = 10;
    let (updater, alerts, metrics) =
        build_updater(engine, registry, compose, vec![svc.clone()]);

    let token = CancellationToken::new();
    updater.check_and_update(&token, &svc).await.unwrap();
    wait_for_deploy_to_finish(&updater, "app").await;

    let alerts = alerts.lock().unwrap();
    let last = alerts.last().unwrap();
    assert_eq!(last.event, AlertEvent::RolledBack);
    assert_eq!(last.reason.as_deref(), Some("warming up"));
    assert!(metrics
        .export()
        .contains(r#"warden_rollbacks_total{service="app"} 1"#));
}

#[tokio::test(start_paused = true)]
async fn compose_pull_failure_clears_deploy_flag() {
    let engine = Arc::new(MockEngine::default());
    engine.put_image(&format!("{REPO}:latest"), local_image("sha256:aaa"));

    let registry = Arc::new(MockRegistry::with_digest("sha256:bbb"));
    let compose = Arc::new(MockCompose::default());
    compose
        .fail_pull
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let (updater, alerts, metrics) =
        build_updater(engine, registry, compose, vec![service("app")]);

    let svc = updater.services()[0].clone();
    let token = CancellationToken::new();
    let result = updater.check_and_update(&token, &svc).await;

    assert!(result.is_err());
    assert!(!updater.is_deploying("app"));
    // Nothing changed, so no rollback and no alert.
    assert!(alerts.lock().unwrap().is_empty());
    assert!(!metrics
        .export()
        .contains(r#"warden_rollbacks_total{service="app"}"#));
}

#[tokio::test(start_paused = true)]
async fn registry_errors_do_not_abort_the_cycle() {
    let engine = Arc::new(MockEngine::default());
    let registry = Arc::new(MockRegistry::with_digest("sha256:aaa"));
    registry.set_error("registry unreachable");
    let compose = Arc::new(MockCompose::default());
    let (updater, alerts, metrics) = build_updater(
        engine,
        registry,
        compose,
        vec![service("app"), service("web")],
    );

    let token = CancellationToken::new();
    updater.poll_all(&token).await;

    // Both services were attempted; the failures stayed per-service.
    assert!(alerts.lock().unwrap().is_empty());
    assert!(metrics.export().contains("warden_poll_cycles_total 1"));
}
