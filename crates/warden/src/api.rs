//! Control API: localhost HTTP surface for manual triggers, blocked-digest
//! management, health and metrics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::error_handling::HandleErrorLayer;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{BoxError, Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::{info, warn};
use warden_lib::metrics::TEXT_CONTENT_TYPE;
use warden_lib::{MetricsSink, Updater};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub updater: Updater,
    pub metrics: Arc<MetricsSink>,
}

/// Builds the router. Method routers answer 405 for wrong methods; the
/// explicit trailing-slash routes answer 400 for an empty name segment.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/trigger", post(trigger_all))
        .route("/trigger/", post(missing_name))
        .route("/trigger/{service}", post(trigger_service))
        .route("/blocked", get(list_blocked))
        .route("/blocked/", delete(missing_name))
        .route("/blocked/{service}", delete(unblock_service))
        .route("/not-found", get(list_not_found))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|_: BoxError| async {
                    StatusCode::REQUEST_TIMEOUT
                }))
                .timeout(Duration::from_secs(30)),
        )
        .with_state(state)
}

/// Serves the API on localhost only, closing gracefully on cancellation.
pub async fn serve(port: u16, state: AppState, token: CancellationToken) -> Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind control API on {addr}"))?;
    info!(addr = %addr, "control API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .context("control API server")?;
    Ok(())
}

/// POST /trigger - poll every service now.
async fn trigger_all(State(state): State<AppState>) -> impl IntoResponse {
    info!("manual trigger: all services");
    let updater = state.updater.clone();
    // Detached from the request and from shutdown, like a regular poll tick.
    tokio::spawn(async move {
        updater.poll_all(&CancellationToken::new()).await;
    });
    Json(json!({"status": "triggered", "scope": "all"}))
}

/// POST /trigger/{service} - poll a single service now.
async fn trigger_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Response {
    let Some(svc) = state
        .updater
        .services()
        .iter()
        .find(|svc| svc.name == service)
        .cloned()
    else {
        return (StatusCode::NOT_FOUND, "service not found").into_response();
    };

    if !svc.auto_update {
        return Json(json!({"status": "skipped", "reason": "auto_update is false"}))
            .into_response();
    }
    if state.updater.is_deploying(&service) {
        return Json(json!({"status": "skipped", "reason": "deploy in progress"}))
            .into_response();
    }

    info!(service = %service, "manual trigger");
    let updater = state.updater.clone();
    tokio::spawn(async move {
        if let Err(error) = updater
            .check_and_update(&CancellationToken::new(), &svc)
            .await
        {
            warn!(service = %svc.name, error = %error, "manual trigger failed");
        }
    });

    Json(json!({"status": "triggered", "scope": service})).into_response()
}

/// GET /blocked - snapshot of blocked digests.
async fn list_blocked(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.updater.blocked_digests())
}

/// DELETE /blocked/{service} - drop a blocked digest.
async fn unblock_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> impl IntoResponse {
    if state.updater.unblock_service(&service) {
        Json(json!({"status": "unblocked", "service": service}))
    } else {
        Json(json!({"status": "not_blocked", "service": service}))
    }
}

/// GET /not-found - snapshot of not-found suppressions.
async fn list_not_found(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.updater.not_found_services())
}

/// GET /health - liveness of the guardian itself.
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// GET /metrics - text exposition format.
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)],
        state.metrics.export(),
    )
}

async fn missing_name() -> impl IntoResponse {
    (StatusCode::BAD_REQUEST, "service name required")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use futures_util::stream::{self, BoxStream, StreamExt};
    use tower::ServiceExt;
    use warden_lib::compose::ComposeRunner;
    use warden_lib::engine::{ContainerDetails, ContainerEngine, EngineEvent, ImageDetails};
    use warden_lib::registry::ImageRegistry;
    use warden_lib::{Dispatcher, ServiceSpec, UpdaterSettings};

    struct StubEngine;

    #[async_trait]
    impl ContainerEngine for StubEngine {
        async fn containers_for_project(&self, _project: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }

        async fn inspect_container(&self, id: &str) -> anyhow::Result<ContainerDetails> {
            Err(anyhow!("no such container: {id}"))
        }

        async fn restart_container(&self, _id: &str, _timeout_secs: i64) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop_container(&self, _id: &str, _timeout_secs: i64) -> anyhow::Result<()> {
            Ok(())
        }

        async fn inspect_image(&self, reference: &str) -> anyhow::Result<ImageDetails> {
            Err(anyhow!("no such image: {reference}"))
        }

        async fn tag_image(&self, _src: &str, _repo: &str, _tag: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn pull_image(&self, _reference: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn remove_image(&self, _reference: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn events(&self) -> BoxStream<'_, anyhow::Result<EngineEvent>> {
            stream::pending().boxed()
        }
    }

    struct StubRegistry;

    #[async_trait]
    impl ImageRegistry for StubRegistry {
        async fn remote_digest(&self, _image: &str) -> anyhow::Result<String> {
            Err(anyhow!("registry offline"))
        }
    }

    struct StubCompose;

    #[async_trait]
    impl ComposeRunner for StubCompose {
        async fn pull(
            &self,
            _token: &CancellationToken,
            _file: &str,
            _project: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn up(
            &self,
            _token: &CancellationToken,
            _file: &str,
            _project: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn spec(name: &str, auto_update: bool) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: format!("{name}:latest"),
            compose_file: format!("/srv/{name}/compose.yaml"),
            compose_project: name.to_string(),
            container_name: String::new(),
            auto_update,
            auto_heal: false,
            health_grace: 60,
            heal_cooldown: 300,
            heal_max_restarts: 3,
        }
    }

    fn test_state() -> AppState {
        let metrics = Arc::new(MetricsSink::new());
        let updater = Updater::new(
            UpdaterSettings {
                registry_url: "http://localhost:5000".to_string(),
                poll_interval: Duration::from_secs(300),
            },
            vec![spec("app", true), spec("manual", false)],
            Arc::new(StubEngine),
            Arc::new(StubRegistry),
            Arc::new(StubCompose),
            Arc::new(Dispatcher::new(vec![])),
            metrics.clone(),
        );
        AppState { updater, metrics }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = router(test_state());
        let response = app.oneshot(request("GET", "/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn metrics_exposes_text_format() {
        let state = test_state();
        state.metrics.inc_updates("app");
        let app = router(state);

        let response = app.oneshot(request("GET", "/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(r#"warden_updates_total{service="app"} 1"#));
    }

    #[tokio::test]
    async fn trigger_all_responds_immediately() {
        let app = router(test_state());
        let response = app.oneshot(request("POST", "/trigger")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "triggered");
        assert_eq!(body["scope"], "all");
    }

    #[tokio::test]
    async fn trigger_unknown_service_is_404() {
        let app = router(test_state());
        let response = app.oneshot(request("POST", "/trigger/ghost")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_without_auto_update_is_skipped() {
        let app = router(test_state());
        let response = app
            .oneshot(request("POST", "/trigger/manual"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "skipped");
        assert_eq!(body["reason"], "auto_update is false");
    }

    #[tokio::test]
    async fn trigger_known_service_spawns_check() {
        let app = router(test_state());
        let response = app.oneshot(request("POST", "/trigger/app")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "triggered");
        assert_eq!(body["scope"], "app");
    }

    #[tokio::test]
    async fn blocked_endpoints_reflect_state() {
        let state = test_state();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(request("GET", "/blocked"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({}));

        let response = app
            .oneshot(request("DELETE", "/blocked/app"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "not_blocked");
        assert_eq!(body["service"], "app");
    }

    #[tokio::test]
    async fn not_found_listing_starts_empty() {
        let app = router(test_state());
        let response = app.oneshot(request("GET", "/not-found")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({}));
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let app = router(test_state());
        let response = app.oneshot(request("GET", "/trigger")).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn empty_service_name_is_400() {
        let app = router(test_state());
        let response = app.oneshot(request("POST", "/trigger/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
