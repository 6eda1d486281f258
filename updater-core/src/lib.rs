//! image-updater core library: domain types, configuration, tag ordering,
//! manifest rewriting, errors.
//!
//! - [`types`]: newtypes and domain structs
//! - [`error`]: [`ErrorKind`], [`ConfigError`], [`ManifestError`]
//! - [`config`]: load / resolve / init
//! - [`ordering`]: [`TagPolicy`]
//! - [`manifest`]: [`ManifestMutation`]

pub mod config;
pub mod error;
pub mod manifest;
pub mod ordering;
pub mod types;

pub use config::{ConfigFile, EngineConfig, GitConfig, RegistryEndpoint, Settings};
pub use error::{ConfigError, ErrorKind, ManifestError};
pub use manifest::{read_image, ManifestImage, ManifestMutation, ManifestSchema};
pub use ordering::TagPolicy;
pub use types::{
    DeployedImage, DeploymentId, DeploymentRecord, Digest, Environment, EnvironmentId, GitAuth,
    ImageRef, Initiator, Outcome, RegistryCredentials, RepositoryRef, Secret, TagInfo,
};
