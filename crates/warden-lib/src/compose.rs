//! Compose tool driver.
//!
//! Deploys go through the compose CLI rather than the engine API so that
//! recreate semantics (depends_on, networks, volumes) stay identical to a
//! manual `docker compose up`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Contract for the compose subprocess driver.
#[async_trait]
pub trait ComposeRunner: Send + Sync {
    /// Runs `docker compose -p <project> -f <file> pull`.
    async fn pull(&self, token: &CancellationToken, file: &str, project: &str) -> Result<()>;

    /// Runs `docker compose -p <project> -f <file> up -d`.
    async fn up(&self, token: &CancellationToken, file: &str, project: &str) -> Result<()>;
}

/// Compose driver shelling out to the `docker` CLI, inheriting the engine
/// authority of the invoking user.
pub struct ComposeCli;

impl ComposeCli {
    async fn run(
        &self,
        token: &CancellationToken,
        file: &str,
        project: &str,
        verb: &[&str],
    ) -> Result<()> {
        let mut args = vec!["compose", "-p", project, "-f", file];
        args.extend_from_slice(verb);
        debug!(command = %format!("docker {}", args.join(" ")), "running compose");

        let mut command = Command::new("docker");
        command.args(&args).kill_on_drop(true);

        let output = tokio::select! {
            _ = token.cancelled() => bail!("docker compose {} cancelled", verb[0]),
            result = command.output() => {
                result.with_context(|| format!("spawn docker compose {}", verb[0]))?
            }
        };

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            bail!(
                "docker compose {} exited with {}: {}",
                verb[0],
                output.status,
                combined.trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ComposeRunner for ComposeCli {
    async fn pull(&self, token: &CancellationToken, file: &str, project: &str) -> Result<()> {
        self.run(token, file, project, &["pull"]).await
    }

    async fn up(&self, token: &CancellationToken, file: &str, project: &str) -> Result<()> {
        self.run(token, file, project, &["up", "-d"]).await
    }
}
