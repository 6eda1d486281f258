//! Error types for updater-core.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by every crate in the workspace.
///
/// Each crate-level error maps onto one of these via its `kind()` method, and
/// the kebab-case form is what lands in a failed deployment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    RegistryUnreachable,
    RegistryAuthFailed,
    RegistryNotFound,
    DigestUnavailable,
    RepositoryCloneFailed,
    FileNotFound,
    /// Non-fast-forward push rejection; the only recoverable kind.
    PushConflict,
    PushFailed,
    ManifestMalformed,
    Timeout,
    AlreadyInProgress,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RegistryUnreachable => "registry-unreachable",
            ErrorKind::RegistryAuthFailed => "registry-auth-failed",
            ErrorKind::RegistryNotFound => "registry-not-found",
            ErrorKind::DigestUnavailable => "digest-unavailable",
            ErrorKind::RepositoryCloneFailed => "repository-clone-failed",
            ErrorKind::FileNotFound => "file-not-found",
            ErrorKind::PushConflict => "push-conflict",
            ErrorKind::PushFailed => "push-failed",
            ErrorKind::ManifestMalformed => "manifest-malformed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AlreadyInProgress => "already-in-progress",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::PushConflict)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All errors that can arise from loading, validating, or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file path.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("config not found at {path}; run `image-updater init` first")]
    ConfigNotFound { path: PathBuf },

    /// A `*_env` secret reference names a variable that is not set.
    #[error("environment variable {var} (referenced by {context}) is not set")]
    MissingEnv { var: String, context: String },

    #[error("environment '{environment}' references unknown repository '{repository}'")]
    UnknownRepository {
        environment: String,
        repository: String,
    },

    #[error("duplicate environment id '{0}'")]
    DuplicateEnvironment(String),

    #[error("duplicate repository id '{0}'")]
    DuplicateRepository(String),

    #[error("invalid image reference '{0}'")]
    InvalidImageRef(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors from locating or rewriting fields in a manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("manifest is not valid UTF-8")]
    NotUtf8,

    #[error("manifest is not valid YAML: {0}")]
    Parse(String),

    #[error("manifest field '{path}' is missing")]
    MissingField { path: String },

    #[error("manifest field '{path}' cannot be rewritten: {reason}")]
    Unsupported { path: String, reason: String },

    #[error("manifest rewrite verification failed: {0}")]
    Verification(String),
}

impl ManifestError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ManifestMalformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_kebab_case() {
        assert_eq!(ErrorKind::PushConflict.to_string(), "push-conflict");
        assert_eq!(ErrorKind::RegistryAuthFailed.as_str(), "registry-auth-failed");
        let json = serde_json_like(ErrorKind::DigestUnavailable);
        assert_eq!(json, "digest-unavailable");
    }

    #[test]
    fn only_push_conflict_is_recoverable() {
        assert!(ErrorKind::PushConflict.is_recoverable());
        assert!(!ErrorKind::PushFailed.is_recoverable());
        assert!(!ErrorKind::Timeout.is_recoverable());
    }

    fn serde_json_like(kind: ErrorKind) -> String {
        serde_yaml::to_string(&kind)
            .expect("serialize")
            .trim()
            .to_string()
    }
}
