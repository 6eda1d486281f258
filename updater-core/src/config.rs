//! YAML configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.image-updater/
//!   config.yaml     (mode 0600, created by `image-updater init`)
//!   ledger/         (deployment history, one JSON file per environment)
//! ```
//!
//! # API pattern
//!
//! Every function touching the filesystem has two forms:
//! - `fn_at(home: &Path, …)`: explicit home, used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! [`ConfigFile`] is the raw document. [`resolve`] validates it and turns it
//! into [`Settings`], with secret references (`password_env`, `token_env`)
//! read from the process environment.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::manifest::ManifestSchema;
use crate::ordering::TagPolicy;
use crate::types::{
    Environment, EnvironmentId, GitAuth, ImageRef, RegistryCredentials, RepositoryRef, Secret,
};

pub const CONFIG_DIR: &str = ".image-updater";
pub const CONFIG_FILE: &str = "config.yaml";
pub const CONFIG_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// 1. Raw document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            defaults: Defaults::default(),
            engine: EngineConfig::default(),
            git: GitConfig::default(),
            registries: vec![],
            repositories: vec![],
            environments: vec![],
        }
    }
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

/// Fallbacks for per-environment settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub policy: TagPolicy,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            policy: TagPolicy::default(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    300
}

/// Reconciliation engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Commit/push attempts per run before giving up on conflicts.
    #[serde(default = "default_max_push_attempts")]
    pub max_push_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Upper bound on a single reconciliation run.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// Commits walked when looking up a file's last modification.
    #[serde(default = "default_history_depth")]
    pub history_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_push_attempts: default_max_push_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            deadline_secs: default_deadline_secs(),
            history_depth: default_history_depth(),
        }
    }
}

impl EngineConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

fn default_max_push_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    5_000
}
fn default_deadline_secs() -> u64 {
    120
}
fn default_history_depth() -> u32 {
    50
}

/// Bot identity and commit message template.
///
/// The template accepts `{application}`, `{environment}`, `{tag}` and
/// `{image}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
            commit_message: default_commit_message(),
        }
    }
}

impl GitConfig {
    pub fn render_message(&self, environment: &Environment, tag: &str) -> String {
        self.commit_message
            .replace("{application}", &environment.application)
            .replace("{environment}", &environment.id.0)
            .replace("{tag}", tag)
            .replace("{image}", &environment.image.to_string())
    }
}

fn default_author_name() -> String {
    "Image Updater".to_string()
}
fn default_author_email() -> String {
    "image-updater@example.com".to_string()
}
fn default_commit_message() -> String {
    "Update image version to {tag}".to_string()
}

/// A container registry host and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub host: String,
    /// Base URL override; defaults to `https://<host>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub auth: GitAuthConfig,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum GitAuthConfig {
    #[default]
    None,
    SshKey {
        key_path: PathBuf,
    },
    Basic {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password_env: Option<String>,
    },
    Bearer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_env: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub id: String,
    pub application: String,
    /// Id of an entry in `repositories`.
    pub repository: String,
    pub manifest_path: PathBuf,
    /// Overrides the repository's branch for this environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub image: ImageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<TagPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub schema: ManifestSchema,
}

// ---------------------------------------------------------------------------
// 2. Resolved settings
// ---------------------------------------------------------------------------

/// Where to reach a registry host and with which credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEndpoint {
    pub host: String,
    pub endpoint: String,
    pub credentials: RegistryCredentials,
}

/// Validated configuration with secrets resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub defaults: Defaults,
    pub engine: EngineConfig,
    pub git: GitConfig,
    pub registries: Vec<RegistryEndpoint>,
    pub environments: Vec<Environment>,
}

impl Settings {
    pub fn environment(&self, id: &EnvironmentId) -> Option<&Environment> {
        self.environments.iter().find(|e| &e.id == id)
    }
}

/// Base URL used for a registry host with no explicit endpoint.
pub fn default_endpoint(host: &str) -> String {
    match host {
        "docker.io" | "index.docker.io" => "https://registry-1.docker.io".to_string(),
        _ => format!("https://{host}"),
    }
}

/// Validate `file` and resolve secret references from the process environment.
pub fn resolve(file: &ConfigFile) -> Result<Settings, ConfigError> {
    resolve_with(file, |var| std::env::var(var).ok())
}

/// [`resolve`] with an explicit variable lookup.
pub fn resolve_with<F>(file: &ConfigFile, lookup: F) -> Result<Settings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    validate(file)?;

    let mut registries = Vec::with_capacity(file.registries.len());
    for reg in &file.registries {
        let context = format!("registry {}", reg.host);
        registries.push(RegistryEndpoint {
            host: reg.host.clone(),
            endpoint: reg
                .endpoint
                .clone()
                .unwrap_or_else(|| default_endpoint(&reg.host))
                .trim_end_matches('/')
                .to_string(),
            credentials: RegistryCredentials {
                username: reg.username.clone(),
                password: secret(&reg.password, &reg.password_env, &lookup, &context)?,
                token: secret(&reg.token, &reg.token_env, &lookup, &context)?,
            },
        });
    }

    let mut environments = Vec::with_capacity(file.environments.len());
    for env in &file.environments {
        let repo = file
            .repositories
            .iter()
            .find(|r| r.id == env.repository)
            .ok_or_else(|| ConfigError::UnknownRepository {
                environment: env.id.clone(),
                repository: env.repository.clone(),
            })?;
        let context = format!("repository {}", repo.id);
        let auth = match &repo.auth {
            GitAuthConfig::None => GitAuth::None,
            GitAuthConfig::SshKey { key_path } => GitAuth::SshKey {
                key_path: key_path.clone(),
            },
            GitAuthConfig::Basic {
                username,
                password,
                password_env,
            } => GitAuth::Basic {
                username: username.clone(),
                password: secret(password, password_env, &lookup, &context)?.ok_or_else(|| {
                    ConfigError::Invalid(format!("{context}: basic auth needs a password"))
                })?,
            },
            GitAuthConfig::Bearer { token, token_env } => GitAuth::Bearer {
                token: secret(token, token_env, &lookup, &context)?.ok_or_else(|| {
                    ConfigError::Invalid(format!("{context}: bearer auth needs a token"))
                })?,
            },
        };

        environments.push(Environment {
            id: EnvironmentId::from(env.id.as_str()),
            application: env.application.clone(),
            repository: RepositoryRef {
                url: repo.url.clone(),
                branch: env.branch.clone().unwrap_or_else(|| repo.branch.clone()),
                auth,
            },
            manifest_path: env.manifest_path.clone(),
            image: env.image.clone(),
            policy: env.policy.unwrap_or(file.defaults.policy),
            schema: env.schema.clone(),
            poll_interval: Duration::from_secs(
                env.poll_interval_secs
                    .unwrap_or(file.defaults.poll_interval_secs),
            ),
            current: None,
        });
    }

    Ok(Settings {
        defaults: file.defaults.clone(),
        engine: file.engine.clone(),
        git: file.git.clone(),
        registries,
        environments,
    })
}

/// `env_var` wins over an inline value; a named but unset variable is an error.
fn secret<F>(
    inline: &Option<String>,
    env_var: &Option<String>,
    lookup: &F,
    context: &str,
) -> Result<Option<Secret>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(var) = env_var {
        return lookup(var)
            .map(|v| Some(Secret::new(v)))
            .ok_or_else(|| ConfigError::MissingEnv {
                var: var.clone(),
                context: context.to_string(),
            });
    }
    Ok(inline.clone().map(Secret::new))
}

fn validate(file: &ConfigFile) -> Result<(), ConfigError> {
    if file.engine.max_push_attempts == 0 {
        return Err(ConfigError::Invalid(
            "engine.max_push_attempts must be at least 1".into(),
        ));
    }
    if file.engine.deadline_secs == 0 {
        return Err(ConfigError::Invalid("engine.deadline_secs must be positive".into()));
    }
    if file.defaults.poll_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "defaults.poll_interval_secs must be positive".into(),
        ));
    }

    let mut repo_ids = HashSet::new();
    for repo in &file.repositories {
        if !repo_ids.insert(repo.id.as_str()) {
            return Err(ConfigError::DuplicateRepository(repo.id.clone()));
        }
    }

    let mut env_ids = HashSet::new();
    for env in &file.environments {
        if env.id.trim().is_empty() {
            return Err(ConfigError::Invalid("environment id must not be empty".into()));
        }
        if !env_ids.insert(env.id.as_str()) {
            return Err(ConfigError::DuplicateEnvironment(env.id.clone()));
        }
        if !repo_ids.contains(env.repository.as_str()) {
            return Err(ConfigError::UnknownRepository {
                environment: env.id.clone(),
                repository: env.repository.clone(),
            });
        }
        let escapes = env
            .manifest_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || env.manifest_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "environment '{}': manifest_path must be relative to the repository root",
                env.id
            )));
        }
        if env.poll_interval_secs == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "environment '{}': poll_interval_secs must be positive",
                env.id
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 3. Paths
// ---------------------------------------------------------------------------

/// `<home>/.image-updater/`. Pure, no I/O.
pub fn config_dir_at(home: &Path) -> PathBuf {
    home.join(CONFIG_DIR)
}

/// `<home>/.image-updater/config.yaml`. Pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    config_dir_at(home).join(CONFIG_FILE)
}

/// `<home>/.image-updater/ledger/`. Pure, no I/O.
pub fn ledger_dir_at(home: &Path) -> PathBuf {
    config_dir_at(home).join("ledger")
}

/// `config_path_at` convenience wrapper.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_path_at(&home()?))
}

/// `ledger_dir_at` convenience wrapper.
pub fn ledger_dir() -> Result<PathBuf, ConfigError> {
    Ok(ledger_dir_at(&home()?))
}

// ---------------------------------------------------------------------------
// 4. Load / save
// ---------------------------------------------------------------------------

/// Load the raw config document.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path) if malformed.
pub fn load_at(home: &Path) -> Result<ConfigFile, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<ConfigFile, ConfigError> {
    load_at(&home()?)
}

/// Load, validate, and resolve the config under `home`.
pub fn load_settings_at(home: &Path) -> Result<Settings, ConfigError> {
    resolve(&load_at(home)?)
}

/// `load_settings_at` convenience wrapper.
pub fn load_settings() -> Result<Settings, ConfigError> {
    load_settings_at(&home()?)
}

/// Atomically write the config document.
///
/// Write flow: serialize → `config.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, file: &ConfigFile) -> Result<(), ConfigError> {
    let dir = ensure_config_dir_at(home)?;
    let path = dir.join(CONFIG_FILE);
    let tmp_path = dir.join(format!("{CONFIG_FILE}.tmp"));

    let yaml = serde_yaml::to_string(file)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Create `<home>/.image-updater/` (mode `0700`) if it does not exist.
pub fn ensure_config_dir_at(home: &Path) -> Result<PathBuf, ConfigError> {
    let dir = config_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    Ok(dir)
}

const STARTER_CONFIG: &str = "\
# image-updater configuration
version: 1

defaults:
  poll_interval_secs: 300
  policy: semver

engine:
  max_push_attempts: 3
  backoff_base_ms: 500
  backoff_max_ms: 5000
  deadline_secs: 120
  history_depth: 50

git:
  author_name: Image Updater
  author_email: image-updater@example.com
  commit_message: Update image version to {tag}

# registries:
#   - host: ghcr.io
#     username: deploy-bot
#     token_env: GHCR_TOKEN
registries: []

# repositories:
#   - id: deploy
#     url: git@github.com:acme/deploy.git
#     branch: main
#     auth:
#       method: ssh_key
#       key_path: /home/bot/.ssh/id_ed25519
repositories: []

# environments:
#   - id: staging
#     application: my-app
#     repository: deploy
#     manifest_path: apps/my-app/values-staging.yaml
#     image: docker.io/library/nginx
#     schema:
#       tag_path: image.tag
#       repository_path: image.repository
environments: []
";

/// Write a starter `config.yaml` if none exists.
///
/// Idempotent: an existing file is loaded and returned unchanged. The bool
/// is `true` when a new file was written.
pub fn init_at(home: &Path) -> Result<(ConfigFile, bool), ConfigError> {
    let path = config_path_at(home);
    if path.exists() {
        return Ok((load_at(home)?, false));
    }

    let dir = ensure_config_dir_at(home)?;
    let tmp_path = dir.join(format!("{CONFIG_FILE}.tmp"));
    std::fs::write(&tmp_path, STARTER_CONFIG)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok((load_at(home)?, true))
}

/// `init_at` convenience wrapper.
pub fn init() -> Result<(ConfigFile, bool), ConfigError> {
    init_at(&home()?)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
