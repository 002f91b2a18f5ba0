//! Core data models shared between the control loops and the binary.

use serde::Deserialize;

/// A watched workload from the configuration file.
///
/// Optional string fields use the empty string for "unset"; validation at
/// load time enforces the cross-field requirements below.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSpec {
    /// Unique service name.
    pub name: String,
    /// Registry-relative image reference (`name:tag`). Required when
    /// `auto_update` is set.
    #[serde(default)]
    pub image: String,
    /// Compose file driving the service. Required when `auto_update` is set.
    #[serde(default)]
    pub compose_file: String,
    /// Compose project used for container lookup and event matching.
    #[serde(default)]
    pub compose_project: String,
    /// Container name for matching standalone (non-compose) containers.
    #[serde(default)]
    pub container_name: String,
    /// Poll the registry and redeploy on digest changes.
    #[serde(default)]
    pub auto_update: bool,
    /// Restart the container on unhealthy events.
    #[serde(default)]
    pub auto_heal: bool,
    /// Seconds to wait for the new container to become healthy after a
    /// deploy before rolling back.
    #[serde(default = "default_health_grace")]
    pub health_grace: u64,
    /// Minimum seconds between auto-heal restarts of one container.
    #[serde(default = "default_heal_cooldown")]
    pub heal_cooldown: u64,
    /// Consecutive failed restarts before the healer gives up.
    #[serde(default = "default_heal_max_restarts")]
    pub heal_max_restarts: u32,
}

pub(crate) fn default_health_grace() -> u64 {
    60
}

pub(crate) fn default_heal_cooldown() -> u64 {
    300
}

pub(crate) fn default_heal_max_restarts() -> u32 {
    3
}
