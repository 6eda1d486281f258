//! Domain types for the image updater.
//!
//! Manifest paths are `PathBuf`s relative to the tracked repository root.
//! Records serialize through serde (JSON for the ledger, YAML for config).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::manifest::ManifestSchema;
use crate::ordering::TagPolicy;

/// Registry assumed when an image reference carries no host.
pub const DEFAULT_REGISTRY: &str = "docker.io";
/// Namespace assumed for single-component image names (`nginx`).
pub const DEFAULT_NAMESPACE: &str = "library";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed identifier for a tracked environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentId(pub String);

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EnvironmentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EnvironmentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed identifier for a deployment record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentId(pub String);

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DeploymentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeploymentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Content digest as reported by the registry (`sha256:…`). Opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Digest {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Digest {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A secret string. `Debug` and `Display` never print the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// A logical image, independent of any tag.
///
/// Serialized as `registry/namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    pub registry: String,
    pub namespace: String,
    pub name: String,
}

impl ImageRef {
    pub fn new(
        registry: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// `namespace/name`, the path segment used by the registry API.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether `repository` (as written in a manifest) names this image.
    ///
    /// Accepts `name`, `namespace/name`, and `registry/namespace/name`.
    pub fn matches_repository(&self, repository: &str) -> bool {
        match repository.parse::<ImageRef>() {
            Ok(other) => {
                other.namespace == self.namespace
                    && other.name == self.name
                    && (other.registry == self.registry
                        || !repository_has_registry(repository))
            }
            Err(_) => false,
        }
    }
}

fn repository_has_registry(repository: &str) -> bool {
    repository
        .split_once('/')
        .map(|(first, _)| looks_like_host(first))
        .unwrap_or(false)
}

fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

impl FromStr for ImageRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.contains('@') || trimmed.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidImageRef(s.to_string()));
        }

        let mut parts: Vec<&str> = trimmed.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::InvalidImageRef(s.to_string()));
        }

        let registry = if parts.len() > 1 && looks_like_host(parts[0]) {
            parts.remove(0).to_string()
        } else {
            DEFAULT_REGISTRY.to_string()
        };

        let Some(name) = parts.pop() else {
            return Err(ConfigError::InvalidImageRef(s.to_string()));
        };
        // A tag suffix belongs in the environment's manifest, not the image.
        if name.contains(':') {
            return Err(ConfigError::InvalidImageRef(s.to_string()));
        }
        let namespace = if parts.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            parts.join("/")
        };

        Ok(Self::new(registry, namespace, name))
    }
}

impl TryFrom<String> for ImageRef {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageRef> for String {
    fn from(image: ImageRef) -> Self {
        image.to_string()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.registry, self.namespace, self.name)
    }
}

/// A tag as observed in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    pub name: String,
    pub digest: Digest,
    /// Creation time when the registry reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

impl TagInfo {
    /// Timestamp used for tie-breaking: creation time, else first observation.
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.created_at.unwrap_or(self.observed_at)
    }
}

/// The image an environment is believed to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedImage {
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    pub observed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Repositories and credentials
// ---------------------------------------------------------------------------

/// How git authenticates against a repository remote.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GitAuth {
    #[default]
    None,
    SshKey {
        key_path: PathBuf,
    },
    Basic {
        username: String,
        password: Secret,
    },
    Bearer {
        token: Secret,
    },
}

impl GitAuth {
    pub fn method(&self) -> &'static str {
        match self {
            GitAuth::None => "none",
            GitAuth::SshKey { .. } => "ssh_key",
            GitAuth::Basic { .. } => "basic",
            GitAuth::Bearer { .. } => "bearer",
        }
    }
}

/// A tracked repository: remote, branch, and auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    pub url: String,
    pub branch: String,
    pub auth: GitAuth,
}

/// Credentials delivered to a container registry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistryCredentials {
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub token: Option<Secret>,
}

impl RegistryCredentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) if !user.is_empty() => {
                Some((user.as_str(), password.expose()))
            }
            _ => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.token.is_none() && self.basic().is_none()
    }
}

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

/// A deployment target: one manifest file tracking one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub id: EnvironmentId,
    pub application: String,
    pub repository: RepositoryRef,
    /// Manifest location relative to the repository root.
    pub manifest_path: PathBuf,
    pub image: ImageRef,
    pub policy: TagPolicy,
    pub schema: ManifestSchema,
    pub poll_interval: Duration,
    /// Cached belief about what is deployed. Git is the source of truth.
    pub current: Option<DeployedImage>,
}

// ---------------------------------------------------------------------------
// Deployment records
// ---------------------------------------------------------------------------

/// Who asked for a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    User(String),
    Poller,
    Webhook,
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initiator::User(name) => write!(f, "user:{name}"),
            Initiator::Poller => write!(f, "poller"),
            Initiator::Webhook => write!(f, "webhook"),
        }
    }
}

/// Failure reason recorded when the push-conflict retry bound is exhausted.
pub const REASON_CONFLICT_EXHAUSTED: &str = "conflict-exhausted";
/// Failure reason recorded when a run exceeds its deadline.
pub const REASON_TIMEOUT: &str = "timeout";

/// Lifecycle of a deployment record. Every non-`Pending` state is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed { reason: String },
    /// A push conflict was followed by a re-read showing the candidate was
    /// already deployed by another writer.
    ConflictRetried,
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Succeeded => "succeeded",
            Outcome::Failed { .. } => "failed",
            Outcome::ConflictRetried => "conflict-retried",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Failed { reason } => write!(f, "failed({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// One attempted tag change for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub environment: EnvironmentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_digest: Option<Digest>,
    pub new_tag: String,
    pub new_digest: Digest,
    pub initiator: Initiator,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of commit/push attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub outcome: Outcome,
}

impl DeploymentRecord {
    /// A fresh `Pending` record.
    pub fn pending(
        id: DeploymentId,
        environment: EnvironmentId,
        previous: Option<&DeployedImage>,
        new_tag: impl Into<String>,
        new_digest: Digest,
        initiator: Initiator,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            environment,
            previous_tag: previous.map(|p| p.tag.clone()),
            previous_digest: previous.and_then(|p| p.digest.clone()),
            new_tag: new_tag.into(),
            new_digest,
            initiator,
            created_at: now,
            updated_at: now,
            attempts: 0,
            commit: None,
            outcome: Outcome::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(EnvironmentId::from("production").to_string(), "production");
        assert_eq!(DeploymentId::from("d-01").to_string(), "d-01");
        assert_eq!(Digest::from("sha256:abc").to_string(), "sha256:abc");
    }

    #[test]
    fn image_ref_parse_forms() {
        let full: ImageRef = "ghcr.io/acme/api".parse().expect("full");
        assert_eq!(full, ImageRef::new("ghcr.io", "acme", "api"));

        let short: ImageRef = "acme/api".parse().expect("short");
        assert_eq!(short.registry, DEFAULT_REGISTRY);
        assert_eq!(short.repository(), "acme/api");

        let bare: ImageRef = "nginx".parse().expect("bare");
        assert_eq!(bare.to_string(), "docker.io/library/nginx");

        let nested: ImageRef = "localhost:5000/team/sub/app".parse().expect("nested");
        assert_eq!(nested.registry, "localhost:5000");
        assert_eq!(nested.namespace, "team/sub");
        assert_eq!(nested.name, "app");
    }

    #[test]
    fn image_ref_rejects_tags_and_digests() {
        assert!("nginx:1.25".parse::<ImageRef>().is_err());
        assert!("nginx@sha256:abc".parse::<ImageRef>().is_err());
        assert!("".parse::<ImageRef>().is_err());
        assert!("acme//api".parse::<ImageRef>().is_err());
    }

    #[test]
    fn image_ref_matches_manifest_repository_spellings() {
        let image = ImageRef::new("docker.io", "library", "nginx");
        assert!(image.matches_repository("nginx"));
        assert!(image.matches_repository("library/nginx"));
        assert!(image.matches_repository("docker.io/library/nginx"));
        assert!(!image.matches_repository("ghcr.io/library/nginx"));
        assert!(!image.matches_repository("httpd"));
    }

    #[test]
    fn image_ref_serializes_as_string() {
        let image = ImageRef::new("ghcr.io", "acme", "api");
        let yaml = serde_yaml::to_string(&image).expect("serialize");
        assert_eq!(yaml.trim(), "ghcr.io/acme/api");
        let back: ImageRef = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(back, image);
    }

    #[test]
    fn secret_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.to_string(), "***");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn bearer_or_basic_detection() {
        let creds = RegistryCredentials {
            username: Some("bot".into()),
            password: Some(Secret::new("pw")),
            token: None,
        };
        assert_eq!(creds.basic(), Some(("bot", "pw")));
        assert!(!creds.is_anonymous());
        assert!(RegistryCredentials::anonymous().is_anonymous());
    }

    #[test]
    fn outcome_display_and_terminality() {
        assert_eq!(Outcome::Pending.to_string(), "pending");
        assert_eq!(
            Outcome::failed(REASON_CONFLICT_EXHAUSTED).to_string(),
            "failed(conflict-exhausted)"
        );
        assert!(!Outcome::Pending.is_terminal());
        assert!(Outcome::ConflictRetried.is_terminal());
    }

    #[test]
    fn initiator_display() {
        assert_eq!(Initiator::User("alice".into()).to_string(), "user:alice");
        assert_eq!(Initiator::Poller.to_string(), "poller");
    }

    #[test]
    fn pending_record_copies_previous_image() {
        let previous = DeployedImage {
            tag: "1.24.0".into(),
            digest: Some(Digest::from("sha256:old")),
            observed_at: Utc::now(),
        };
        let record = DeploymentRecord::pending(
            DeploymentId::from("d-1"),
            EnvironmentId::from("staging"),
            Some(&previous),
            "1.25.0",
            Digest::from("sha256:new"),
            Initiator::Poller,
        );
        assert_eq!(record.previous_tag.as_deref(), Some("1.24.0"));
        assert_eq!(record.previous_digest, Some(Digest::from("sha256:old")));
        assert_eq!(record.outcome, Outcome::Pending);
        assert_eq!(record.attempts, 0);
    }
}
