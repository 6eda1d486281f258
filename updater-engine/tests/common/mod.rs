//! In-memory registry and repository fakes for engine tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest as _, Sha256};
use tempfile::TempDir;
use updater_core::{
    Digest, EngineConfig, Environment, EnvironmentId, GitAuth, GitConfig, ImageRef,
    ManifestSchema, RepositoryRef, TagInfo, TagPolicy,
};
use updater_engine::{
    DeploymentLedger, EngineOptions, MemoryLedger, ReconciliationEngine,
};
use updater_registry::{RegistryClient, RegistryError};
use updater_repo::{CommitInfo, FileSnapshot, RepoError, RepositoryClient, WorkingCopy};

pub const MANIFEST: &str = "apps/web/values.yaml";

pub fn values(tag: &str) -> String {
    format!("# web values\nimage:\n  repository: nginx\n  tag: {tag}\nreplicas: 2\n")
}

/// Deterministic fake digest for a seed string.
pub fn digest(seed: &str) -> Digest {
    Digest::from(format!("sha256:{}", hex::encode(Sha256::digest(seed.as_bytes()))))
}

pub fn environment(id: &str) -> Environment {
    Environment {
        id: EnvironmentId::from(id),
        application: "web".to_string(),
        repository: RepositoryRef {
            url: "file:///srv/git/deploy.git".to_string(),
            branch: "main".to_string(),
            auth: GitAuth::None,
        },
        manifest_path: PathBuf::from(MANIFEST),
        image: "nginx".parse::<ImageRef>().expect("image ref"),
        policy: TagPolicy::Semver,
        schema: ManifestSchema::default(),
        poll_interval: Duration::from_secs(300),
        current: None,
    }
}

/// Options with no backoff wait and a short deadline.
pub fn options() -> EngineOptions {
    let engine = EngineConfig {
        backoff_base_ms: 0,
        backoff_max_ms: 0,
        deadline_secs: 30,
        ..EngineConfig::default()
    };
    EngineOptions::new(&engine, GitConfig::default())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeRegistry {
    tags: Mutex<Vec<TagInfo>>,
    unreachable: AtomicBool,
    list_calls: AtomicUsize,
    info_calls: AtomicUsize,
}

impl FakeRegistry {
    pub fn with_tags(tags: &[&str]) -> Self {
        let registry = Self::default();
        for tag in tags {
            registry.push_tag(tag, digest(tag), None);
        }
        registry
    }

    pub fn push_tag(&self, tag: &str, digest: Digest, created_at: Option<DateTime<Utc>>) {
        let mut tags = self.tags.lock().unwrap();
        tags.retain(|t| t.name != tag);
        tags.push(TagInfo {
            name: tag.to_string(),
            digest,
            created_at,
            observed_at: Utc::now(),
        });
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), RegistryError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unreachable {
                registry: "docker.io".into(),
                message: "connection refused".into(),
            });
        }
        Ok(())
    }

    fn find(&self, image: &ImageRef, tag: &str) -> Result<TagInfo, RegistryError> {
        self.tags
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.name == tag)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                resource: format!("{image}:{tag}"),
            })
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn list_tags(&self, _image: &ImageRef) -> Result<Vec<String>, RegistryError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.tags.lock().unwrap().iter().map(|t| t.name.clone()).collect())
    }

    async fn resolve_digest(&self, image: &ImageRef, tag: &str) -> Result<Digest, RegistryError> {
        self.check()?;
        Ok(self.find(image, tag)?.digest)
    }

    async fn tag_info(&self, image: &ImageRef, tag: &str) -> Result<TagInfo, RegistryError> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.find(image, tag)
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Scripted behaviour for the next `commit_and_push` call.
#[derive(Debug, Clone)]
pub enum Push {
    /// Reject as non-fast-forward without touching the remote.
    Conflict,
    /// Another writer lands `content` first, then ours is rejected.
    ConflictAfter(String),
    /// Reject with a non-recoverable error.
    Denied,
    /// Never complete.
    Hang,
}

#[derive(Debug, Clone)]
pub struct PushedCommit {
    pub id: String,
    pub message: String,
    pub content: String,
}

#[derive(Debug)]
struct RemoteState {
    content: String,
    version: u64,
    commits: Vec<PushedCommit>,
}

#[derive(Debug)]
pub struct FakeRepo {
    remote: Mutex<RemoteState>,
    /// Remote version each working copy was cloned at.
    clones: Mutex<HashMap<PathBuf, (u64, String)>>,
    script: Mutex<VecDeque<Push>>,
    clone_failure: AtomicBool,
    clone_hang: AtomicBool,
    clone_count: AtomicUsize,
    push_attempts: AtomicUsize,
    history_depth: AtomicU32,
}

impl FakeRepo {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            remote: Mutex::new(RemoteState {
                content: content.into(),
                version: 0,
                commits: Vec::new(),
            }),
            clones: Mutex::new(HashMap::new()),
            script: Mutex::new(VecDeque::new()),
            clone_failure: AtomicBool::new(false),
            clone_hang: AtomicBool::new(false),
            clone_count: AtomicUsize::new(0),
            push_attempts: AtomicUsize::new(0),
            history_depth: AtomicU32::new(0),
        }
    }

    pub fn script(&self, pushes: impl IntoIterator<Item = Push>) {
        self.script.lock().unwrap().extend(pushes);
    }

    pub fn fail_clones(&self) {
        self.clone_failure.store(true, Ordering::SeqCst);
    }

    /// Make every later clone wait forever.
    pub fn hang_clones(&self) {
        self.clone_hang.store(true, Ordering::SeqCst);
    }

    /// Depth passed to the latest `last_modified` call.
    pub fn history_depth(&self) -> u32 {
        self.history_depth.load(Ordering::SeqCst)
    }

    pub fn content(&self) -> String {
        self.remote.lock().unwrap().content.clone()
    }

    /// Commits that landed on the remote, oldest first.
    pub fn commits(&self) -> Vec<PushedCommit> {
        self.remote.lock().unwrap().commits.clone()
    }

    pub fn clone_count(&self) -> usize {
        self.clone_count.load(Ordering::SeqCst)
    }

    pub fn push_attempts(&self) -> usize {
        self.push_attempts.load(Ordering::SeqCst)
    }

    /// Land a commit as some other writer would.
    pub fn external_commit(&self, content: impl Into<String>) {
        let mut remote = self.remote.lock().unwrap();
        land(&mut remote, content.into(), "external change".to_string());
    }
}

fn land(remote: &mut RemoteState, content: String, message: String) -> String {
    remote.version += 1;
    let id = format!("c{:04}", remote.version);
    remote.content = content.clone();
    remote.commits.push(PushedCommit {
        id: id.clone(),
        message,
        content,
    });
    id
}

#[async_trait]
impl RepositoryClient for FakeRepo {
    async fn clone_repo(&self, repository: &RepositoryRef) -> Result<WorkingCopy, RepoError> {
        self.clone_count.fetch_add(1, Ordering::SeqCst);
        if self.clone_hang.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        if self.clone_failure.load(Ordering::SeqCst) {
            return Err(RepoError::CloneFailed {
                url: repository.url.clone(),
                message: "repository not found".into(),
            });
        }
        let dir = TempDir::new().expect("clone dir");
        let state = {
            let remote = self.remote.lock().unwrap();
            (remote.version, remote.content.clone())
        };
        self.clones
            .lock()
            .unwrap()
            .insert(dir.path().to_path_buf(), state);
        Ok(WorkingCopy::new(dir, repository.clone()))
    }

    async fn read_file(&self, wc: &WorkingCopy, path: &Path) -> Result<FileSnapshot, RepoError> {
        if path != Path::new(MANIFEST) {
            return Err(RepoError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let (_, content) = self
            .clones
            .lock()
            .unwrap()
            .get(wc.path())
            .cloned()
            .expect("read from a known working copy");
        Ok(FileSnapshot {
            path: path.to_path_buf(),
            content: content.into_bytes(),
            last_commit: None,
            last_commit_at: None,
        })
    }

    async fn last_modified(
        &self,
        _wc: &WorkingCopy,
        _path: &Path,
        depth: u32,
    ) -> Result<Option<CommitInfo>, RepoError> {
        self.history_depth.store(depth, Ordering::SeqCst);
        let remote = self.remote.lock().unwrap();
        Ok(remote.commits.last().map(|commit| CommitInfo {
            id: commit.id.clone(),
            author: "image-updater".to_string(),
            timestamp: Utc::now(),
            summary: commit.message.clone(),
        }))
    }

    async fn commit_and_push(
        &self,
        wc: &WorkingCopy,
        _path: &Path,
        content: &[u8],
        message: &str,
    ) -> Result<String, RepoError> {
        self.push_attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let conflict = || RepoError::PushConflict {
            branch: "main".into(),
            message: "! [rejected] HEAD -> main (fetch first)".into(),
        };
        match next {
            Some(Push::Conflict) => return Err(conflict()),
            Some(Push::ConflictAfter(other)) => {
                self.external_commit(other);
                return Err(conflict());
            }
            Some(Push::Denied) => {
                return Err(RepoError::PushFailed {
                    branch: "main".into(),
                    message: "permission denied".into(),
                })
            }
            Some(Push::Hang) => return std::future::pending().await,
            None => {}
        }

        let base = self
            .clones
            .lock()
            .unwrap()
            .get(wc.path())
            .map(|(version, _)| *version)
            .expect("push from a known working copy");
        let mut remote = self.remote.lock().unwrap();
        if remote.version != base {
            return Err(conflict());
        }
        let content = String::from_utf8(content.to_vec()).expect("utf8 manifest");
        Ok(land(&mut remote, content, message.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub registry: Arc<FakeRegistry>,
    pub repo: Arc<FakeRepo>,
    pub ledger: Arc<MemoryLedger>,
    pub engine: Arc<ReconciliationEngine>,
}

impl Harness {
    pub fn new(registry: FakeRegistry, repo: FakeRepo) -> Self {
        Self::with_options(registry, repo, options(), vec![environment("staging")])
    }

    pub fn with_options(
        registry: FakeRegistry,
        repo: FakeRepo,
        options: EngineOptions,
        environments: Vec<Environment>,
    ) -> Self {
        let registry = Arc::new(registry);
        let repo = Arc::new(repo);
        let ledger = Arc::new(MemoryLedger::new());
        let engine = Arc::new(ReconciliationEngine::new(
            registry.clone(),
            repo.clone(),
            ledger.clone() as Arc<dyn DeploymentLedger>,
            options,
            environments,
        ));
        Self {
            registry,
            repo,
            ledger,
            engine,
        }
    }

    pub fn env(&self) -> EnvironmentId {
        EnvironmentId::from("staging")
    }
}
