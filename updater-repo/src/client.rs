//! The repository client abstraction and the values it hands out.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use updater_core::RepositoryRef;

use crate::error::RepoError;

/// A single-use checkout in a private temporary directory.
///
/// The directory is removed when the working copy is dropped.
#[derive(Debug)]
pub struct WorkingCopy {
    dir: TempDir,
    repository: RepositoryRef,
}

impl WorkingCopy {
    pub fn new(dir: TempDir, repository: RepositoryRef) -> Self {
        Self { dir, repository }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn repository(&self) -> &RepositoryRef {
        &self.repository
    }

    pub fn branch(&self) -> &str {
        &self.repository.branch
    }
}

/// File contents at the working copy's HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub path: PathBuf,
    pub content: Vec<u8>,
    /// Last commit touching the file within the fetched history.
    pub last_commit: Option<String>,
    pub last_commit_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
}

/// Clone, read, and commit-push against a Git remote.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Shallow, single-branch clone into a fresh temporary directory.
    async fn clone_repo(&self, repository: &RepositoryRef) -> Result<WorkingCopy, RepoError>;

    /// Read `path` (relative to the repository root) at HEAD.
    async fn read_file(&self, wc: &WorkingCopy, path: &Path) -> Result<FileSnapshot, RepoError>;

    /// Last commit touching `path` among the newest `depth` commits, fetching
    /// more history first when the clone is shallow.
    async fn last_modified(
        &self,
        wc: &WorkingCopy,
        path: &Path,
        depth: u32,
    ) -> Result<Option<CommitInfo>, RepoError>;

    /// Replace `path` with `content`, commit it alone, and push to the
    /// working copy's branch. Returns the new commit id.
    async fn commit_and_push(
        &self,
        wc: &WorkingCopy,
        path: &Path,
        content: &[u8],
        message: &str,
    ) -> Result<String, RepoError>;
}
