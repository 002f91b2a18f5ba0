//! warden - per-host deploy guardian for compose-managed container
//! workloads.
//!
//! Watches a private registry for new image digests, deploys them through
//! the compose tool with health-verified rollback, restarts containers that
//! report themselves unhealthy, and exposes a localhost control API.

mod api;
mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warden_lib::compose::ComposeCli;
use warden_lib::engine::DockerEngine;
use warden_lib::notify::{DiscordNotifier, MailNotifier, WebhookNotifier};
use warden_lib::registry::HttpRegistry;
use warden_lib::{
    Alert, AlertEvent, AlertLevel, Dispatcher, Healer, MetricsSink, Notifier, Updater,
    UpdaterSettings,
};

/// Release builds inject the version through the environment at compile
/// time; local builds fall back to the crate version.
const VERSION: &str = match option_env!("WARDEN_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

/// Per-host deploy guardian for compose-managed container workloads.
#[derive(Parser)]
#[command(name = "warden", version = VERSION)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short, default_value = "/etc/warden/config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();

    let config = config::Config::load(&cli.config)?;
    info!(
        services = config.services.len(),
        poll_interval_secs = config.registry.poll_interval,
        "configuration loaded"
    );

    let dispatcher = Arc::new(Dispatcher::new(build_notifiers(&config)?));

    let engine = Arc::new(DockerEngine::connect()?);
    let registry = Arc::new(HttpRegistry::new(&config.registry.url)?);
    let compose = Arc::new(ComposeCli);
    let metrics = Arc::new(MetricsSink::new());

    let updater = Updater::new(
        UpdaterSettings {
            registry_url: config.registry.url.clone(),
            poll_interval: Duration::from_secs(config.registry.poll_interval),
        },
        config.services.clone(),
        engine.clone(),
        registry,
        compose,
        dispatcher.clone(),
        metrics.clone(),
    );
    let healer = Healer::new(
        config.services.clone(),
        engine,
        dispatcher.clone(),
        updater.watch(),
        metrics.clone(),
    );

    let token = CancellationToken::new();

    let updater_task = {
        let updater = updater.clone();
        let token = token.child_token();
        tokio::spawn(async move { updater.run(token).await })
    };
    let healer_task = {
        let healer = healer.clone();
        let token = token.child_token();
        tokio::spawn(async move { healer.run(token).await })
    };
    let api_task = {
        let state = api::AppState { updater, metrics };
        let port = config.api.port;
        let token = token.child_token();
        tokio::spawn(async move {
            if let Err(err) = api::serve(port, state, token).await {
                error!(error = %err, "control API failed");
            }
        })
    };

    info!(version = VERSION, "warden started");
    dispatcher
        .send(Alert::new(
            "warden",
            AlertEvent::Started,
            AlertLevel::Info,
            "Warden started.",
        ))
        .await;

    wait_for_shutdown_signal()
        .await
        .context("install signal handlers")?;
    info!("shutdown signal received");
    token.cancel();

    let _ = updater_task.await;
    let _ = healer_task.await;
    let _ = api_task.await;

    info!("stopped");
    Ok(())
}

fn build_notifiers(config: &config::Config) -> Result<Vec<Box<dyn Notifier>>> {
    let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();

    if let Some(discord) = &config.notifications.discord {
        if !discord.webhook_url.is_empty() {
            notifiers.push(Box::new(DiscordNotifier::new(&discord.webhook_url)?));
            info!("notification channel enabled: discord");
        }
    }

    if let Some(smtp) = &config.notifications.smtp {
        if !smtp.host.is_empty() {
            notifiers.push(Box::new(MailNotifier::new(
                &smtp.host,
                smtp.port,
                &smtp.from,
                &smtp.to,
                &smtp.username,
                &smtp.password,
            )?));
            info!(from = %smtp.from, to = %smtp.to, "notification channel enabled: mail");
        }
    }

    for webhook in &config.notifications.webhooks {
        notifiers.push(Box::new(
            WebhookNotifier::new(
                &webhook.name,
                &webhook.url,
                &webhook.method,
                webhook.headers.clone(),
                &webhook.body,
            )
            .with_context(|| format!("webhook {:?}", webhook.name))?,
        ));
        info!(name = %webhook.name, "notification channel enabled: webhook");
    }

    Ok(notifiers)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
