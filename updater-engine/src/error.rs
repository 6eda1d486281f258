//! Error types for updater-engine.

use std::path::PathBuf;

use thiserror::Error;
use updater_core::{DeploymentId, EnvironmentId, ErrorKind, ImageRef, ManifestError};
use updater_registry::RegistryError;
use updater_repo::RepoError;

/// Errors from the deployment ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A record was appended or moved in a way its lifecycle forbids.
    #[error("invalid ledger transition for {id}: {reason}")]
    InvalidTransition { id: DeploymentId, reason: String },

    /// The environment already has a `Pending` record.
    #[error("environment {0} already has a pending deployment")]
    PendingExists(EnvironmentId),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience constructor for [`LedgerError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.into(),
        source,
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("reconciliation already in progress for {0}")]
    AlreadyInProgress(EnvironmentId),

    #[error("unknown environment '{0}'")]
    UnknownEnvironment(EnvironmentId),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Ledger failures are programming errors and are never retried.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("manifest declares image '{found}' but the environment tracks {expected}")]
    ImageMismatch { expected: ImageRef, found: String },

    #[error("registry lists no tags for {0}")]
    NoCandidate(ImageRef),

    #[error("reconciliation of {0} exceeded its deadline")]
    Timeout(EnvironmentId),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::AlreadyInProgress(_) => ErrorKind::AlreadyInProgress,
            EngineError::UnknownEnvironment(_) | EngineError::Ledger(_) => ErrorKind::Internal,
            EngineError::Registry(e) => e.kind(),
            EngineError::Repo(e) => e.kind(),
            EngineError::Manifest(e) => e.kind(),
            EngineError::ImageMismatch { .. } => ErrorKind::ManifestMalformed,
            EngineError::NoCandidate(_) => ErrorKind::RegistryNotFound,
            EngineError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// `"<kind>: <message>"`, the form stored in failed records.
    pub fn reason(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}
