//! Shared deploy state coupling the updater and the healer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

/// The three coupling maps, owned by the updater.
///
/// `deploying` carries services with a deploy in flight, `blocked` carries
/// digests that caused a rollback, `not_found` carries remote digests seen
/// while local resolution failed. Memory-only; cleared on restart.
#[derive(Debug, Default)]
pub(crate) struct DeployState {
    deploying: Mutex<HashMap<String, Instant>>,
    blocked: Mutex<HashMap<String, String>>,
    not_found: Mutex<HashMap<String, String>>,
}

impl DeployState {
    /// Atomically claims the deploy slot for a service. Returns false when a
    /// deploy is already in flight (the poll/API/healer race guard).
    pub fn try_start_deploy(&self, service: &str) -> bool {
        let mut deploying = self.deploying.lock().unwrap();
        if deploying.contains_key(service) {
            return false;
        }
        deploying.insert(service.to_string(), Instant::now());
        true
    }

    pub fn clear_deploying(&self, service: &str) {
        self.deploying.lock().unwrap().remove(service);
    }

    pub fn is_deploying(&self, service: &str) -> bool {
        self.deploying.lock().unwrap().contains_key(service)
    }

    pub fn blocked_digest(&self, service: &str) -> Option<String> {
        self.blocked.lock().unwrap().get(service).cloned()
    }

    pub fn block(&self, service: &str, digest: &str) {
        self.blocked
            .lock()
            .unwrap()
            .insert(service.to_string(), digest.to_string());
    }

    /// Removes a blocked entry, reporting whether one existed.
    pub fn clear_blocked(&self, service: &str) -> bool {
        self.blocked.lock().unwrap().remove(service).is_some()
    }

    pub fn blocked_snapshot(&self) -> HashMap<String, String> {
        self.blocked.lock().unwrap().clone()
    }

    pub fn not_found_digest(&self, service: &str) -> Option<String> {
        self.not_found.lock().unwrap().get(service).cloned()
    }

    pub fn set_not_found(&self, service: &str, digest: &str) {
        self.not_found
            .lock()
            .unwrap()
            .insert(service.to_string(), digest.to_string());
    }

    pub fn clear_not_found(&self, service: &str) {
        self.not_found.lock().unwrap().remove(service);
    }

    pub fn not_found_snapshot(&self) -> HashMap<String, String> {
        self.not_found.lock().unwrap().clone()
    }
}

/// Read-only handle handed to the healer; exposes nothing but the deploy
/// predicate so healer code cannot mutate updater state.
#[derive(Clone)]
pub struct DeployWatch {
    state: Arc<DeployState>,
}

impl DeployWatch {
    pub(crate) fn new(state: Arc<DeployState>) -> Self {
        Self { state }
    }

    pub fn is_deploying(&self, service: &str) -> bool {
        self.state.is_deploying(service)
    }
}

/// Scoped release of a claimed deploy slot.
///
/// Created right after `try_start_deploy` succeeds and moved into the
/// verification task, so the slot is released on every exit path, including
/// cancellation and panics.
pub(crate) struct DeployGuard {
    state: Arc<DeployState>,
    service: String,
}

impl DeployGuard {
    pub fn new(state: Arc<DeployState>, service: String) -> Self {
        Self { state, service }
    }
}

impl Drop for DeployGuard {
    fn drop(&mut self) {
        self.state.clear_deploying(&self.service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deploy_slot_is_exclusive() {
        let state = DeployState::default();
        assert!(state.try_start_deploy("api"));
        assert!(!state.try_start_deploy("api"));
        assert!(state.is_deploying("api"));

        state.clear_deploying("api");
        assert!(!state.is_deploying("api"));
        assert!(state.try_start_deploy("api"));
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let state = Arc::new(DeployState::default());
        assert!(state.try_start_deploy("api"));
        {
            let _guard = DeployGuard::new(state.clone(), "api".to_string());
            assert!(state.is_deploying("api"));
        }
        assert!(!state.is_deploying("api"));
    }

    #[tokio::test]
    async fn snapshots_are_copies() {
        let state = DeployState::default();
        state.block("api", "sha256:bad");

        let mut snapshot = state.blocked_snapshot();
        snapshot.insert("other".to_string(), "sha256:x".to_string());

        assert_eq!(state.blocked_snapshot().len(), 1);
        assert_eq!(state.blocked_digest("api").as_deref(), Some("sha256:bad"));
    }

    #[tokio::test]
    async fn clear_blocked_reports_existence() {
        let state = DeployState::default();
        assert!(!state.clear_blocked("api"));
        state.block("api", "sha256:bad");
        assert!(state.clear_blocked("api"));
        assert!(!state.clear_blocked("api"));
    }
}
