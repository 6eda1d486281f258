//! Registry push notifications.
//!
//! A notification names an image and the tag/digest that was just pushed.
//! Every tracked environment on that image gets a non-blocking trigger with
//! the pushed tag as a hint.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use updater_core::types::{DEFAULT_NAMESPACE, DEFAULT_REGISTRY};
use updater_core::{Digest, EnvironmentId, ImageRef, Initiator};
use updater_engine::{Hint, ReconciliationEngine, TriggerStatus};

/// Hostnames that all mean Docker Hub.
const DOCKER_HUB_ALIASES: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Empty for Docker Hub official images.
    #[serde(default)]
    pub namespace: String,
    /// Image name, or `namespace/name` when `namespace` is empty.
    pub repository: String,
    pub tag: String,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

/// Trigger result for one matched environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatched {
    pub environment: EnvironmentId,
    pub status: TriggerStatus,
}

impl Notification {
    /// `(namespace, name)` with Docker Hub defaults applied.
    fn image_path(&self) -> (String, String) {
        let repository = self.repository.trim_matches('/');
        if self.namespace.is_empty() {
            return match repository.rsplit_once('/') {
                Some((namespace, name)) => (namespace.to_string(), name.to_string()),
                None => (DEFAULT_NAMESPACE.to_string(), repository.to_string()),
            };
        }
        (self.namespace.clone(), repository.to_string())
    }

    pub fn matches(&self, image: &ImageRef) -> bool {
        let (namespace, name) = self.image_path();
        if namespace != image.namespace || name != image.name {
            return false;
        }
        match &self.registry {
            Some(registry) => normalize_registry(registry) == normalize_registry(&image.registry),
            None => true,
        }
    }

    pub fn hint(&self) -> Hint {
        Hint {
            tag: self.tag.clone(),
            digest: self.digest.clone(),
        }
    }
}

fn normalize_registry(registry: &str) -> String {
    let host = registry
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_ascii_lowercase();
    if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        DEFAULT_REGISTRY.to_string()
    } else {
        host
    }
}

/// Trigger every environment tracking the notified image.
///
/// Must be called from within a tokio runtime.
pub fn dispatch(engine: &Arc<ReconciliationEngine>, notification: &Notification) -> Vec<Dispatched> {
    let mut dispatched = Vec::new();
    for env in engine.environments() {
        if !notification.matches(&env.image) {
            continue;
        }
        match engine.try_reconcile(&env.id, Initiator::Webhook, Some(notification.hint())) {
            Ok(status) => {
                info!(
                    environment = %env.id,
                    tag = %notification.tag,
                    status = ?status,
                    "webhook trigger",
                );
                dispatched.push(Dispatched {
                    environment: env.id,
                    status,
                });
            }
            // The environment set was swapped between listing and triggering.
            Err(err) => warn!(environment = %env.id, error = %err, "webhook trigger skipped"),
        }
    }
    if dispatched.is_empty() {
        info!(
            repository = %notification.repository,
            tag = %notification.tag,
            "webhook matched no environment",
        );
    }
    dispatched
}
