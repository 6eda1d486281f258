//! Error types for updater-registry.

use thiserror::Error;
use updater_core::ErrorKind;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Transport failure: DNS, connect, TLS, or timeout.
    #[error("registry {registry} unreachable: {message}")]
    Unreachable { registry: String, message: String },

    /// 401/403 after the single re-authentication attempt.
    #[error("authentication against {registry} failed (HTTP {status})")]
    AuthFailed { registry: String, status: u16 },

    #[error("{resource} not found in registry")]
    NotFound { resource: String },

    /// The manifest HEAD succeeded but carried no `Docker-Content-Digest`.
    #[error("registry returned no digest for {image}:{tag}")]
    DigestUnavailable { image: String, tag: String },

    /// Unexpected status or undecodable body.
    #[error("unexpected response from {registry}: {message}")]
    Protocol { registry: String, message: String },

    #[error("registry client setup failed: {0}")]
    Setup(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Unreachable { .. } | RegistryError::Protocol { .. } => {
                ErrorKind::RegistryUnreachable
            }
            RegistryError::AuthFailed { .. } => ErrorKind::RegistryAuthFailed,
            RegistryError::NotFound { .. } => ErrorKind::RegistryNotFound,
            RegistryError::DigestUnavailable { .. } => ErrorKind::DigestUnavailable,
            RegistryError::Setup(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_onto_taxonomy() {
        let err = RegistryError::DigestUnavailable {
            image: "docker.io/library/nginx".into(),
            tag: "1.25".into(),
        };
        assert_eq!(err.kind(), ErrorKind::DigestUnavailable);
        assert!(err.to_string().contains("nginx:1.25"));

        let err = RegistryError::AuthFailed {
            registry: "ghcr.io".into(),
            status: 401,
        };
        assert_eq!(err.kind().as_str(), "registry-auth-failed");
    }
}
