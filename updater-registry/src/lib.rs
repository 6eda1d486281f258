//! Container registry access: tag listing, digest resolution, credentials.

pub mod auth;
pub mod client;
pub mod error;

pub use auth::{Challenge, CredentialsProvider, StaticCredentials};
pub use client::{ClientOptions, HttpRegistryClient, RegistryClient};
pub use error::RegistryError;
