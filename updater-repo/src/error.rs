//! Error types for updater-repo.

use std::path::PathBuf;

use thiserror::Error;
use updater_core::ErrorKind;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("failed to clone {url}: {message}")]
    CloneFailed { url: String, message: String },

    #[error("file not found in working copy: {path}")]
    FileNotFound { path: PathBuf },

    /// The remote branch moved; the push was not a fast-forward.
    #[error("push to {branch} rejected (non-fast-forward): {message}")]
    PushConflict { branch: String, message: String },

    #[error("push to {branch} failed: {message}")]
    PushFailed { branch: String, message: String },

    /// Any other git invocation that exited non-zero.
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    /// The git binary could not be started.
    #[error("failed to run git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RepoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepoError::CloneFailed { .. } => ErrorKind::RepositoryCloneFailed,
            RepoError::FileNotFound { .. } => ErrorKind::FileNotFound,
            RepoError::PushConflict { .. } => ErrorKind::PushConflict,
            RepoError::PushFailed { .. } => ErrorKind::PushFailed,
            RepoError::Git { .. } | RepoError::Spawn(_) | RepoError::Io { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

/// Convenience constructor for [`RepoError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RepoError {
    RepoError::Io {
        path: path.into(),
        source,
    }
}
