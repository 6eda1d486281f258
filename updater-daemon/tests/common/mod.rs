#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use updater_core::{
    Digest, Environment, EnvironmentId, GitAuth, ImageRef, ManifestSchema, RepositoryRef, TagInfo,
    TagPolicy,
};
use updater_engine::{EngineOptions, MemoryLedger, ReconciliationEngine};
use updater_registry::{RegistryClient, RegistryError};
use updater_repo::{CommitInfo, FileSnapshot, RepoError, RepositoryClient, WorkingCopy};

pub fn environment(id: &str, image: &str, poll_secs: u64) -> Environment {
    Environment {
        id: EnvironmentId::from(id),
        application: "web".to_string(),
        repository: RepositoryRef {
            url: "file:///srv/git/deploy.git".to_string(),
            branch: "main".to_string(),
            auth: GitAuth::None,
        },
        manifest_path: PathBuf::from("apps/web/values.yaml"),
        image: image.parse::<ImageRef>().expect("image ref"),
        policy: TagPolicy::Semver,
        schema: ManifestSchema::default(),
        poll_interval: Duration::from_secs(poll_secs),
        current: None,
    }
}

/// Registry with no tags.
#[derive(Debug, Default)]
pub struct EmptyRegistry;

#[async_trait]
impl RegistryClient for EmptyRegistry {
    async fn list_tags(&self, _image: &ImageRef) -> Result<Vec<String>, RegistryError> {
        Ok(Vec::new())
    }

    async fn resolve_digest(&self, image: &ImageRef, tag: &str) -> Result<Digest, RegistryError> {
        Err(RegistryError::NotFound {
            resource: format!("{image}:{tag}"),
        })
    }

    async fn tag_info(&self, image: &ImageRef, tag: &str) -> Result<TagInfo, RegistryError> {
        Err(RegistryError::NotFound {
            resource: format!("{image}:{tag}"),
        })
    }
}

/// Repository whose clones always fail, counting the attempts. Every run
/// ends in the evaluating phase and releases its environment right away.
#[derive(Debug, Default)]
pub struct UnreachableRepo {
    clones: AtomicUsize,
}

impl UnreachableRepo {
    pub fn clones(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepositoryClient for UnreachableRepo {
    async fn clone_repo(&self, repository: &RepositoryRef) -> Result<WorkingCopy, RepoError> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        Err(RepoError::CloneFailed {
            url: repository.url.clone(),
            message: "connection refused".into(),
        })
    }

    async fn read_file(&self, _wc: &WorkingCopy, path: &Path) -> Result<FileSnapshot, RepoError> {
        Err(RepoError::FileNotFound {
            path: path.to_path_buf(),
        })
    }

    async fn last_modified(
        &self,
        _wc: &WorkingCopy,
        _path: &Path,
        _depth: u32,
    ) -> Result<Option<CommitInfo>, RepoError> {
        Ok(None)
    }

    async fn commit_and_push(
        &self,
        _wc: &WorkingCopy,
        _path: &Path,
        _content: &[u8],
        _message: &str,
    ) -> Result<String, RepoError> {
        Err(RepoError::PushFailed {
            branch: "main".into(),
            message: "read-only".into(),
        })
    }
}

pub fn engine(
    repo: Arc<UnreachableRepo>,
    environments: Vec<Environment>,
) -> Arc<ReconciliationEngine> {
    Arc::new(ReconciliationEngine::new(
        Arc::new(EmptyRegistry),
        repo,
        Arc::new(MemoryLedger::new()),
        EngineOptions::default(),
        environments,
    ))
}
