//! Git repository access: shallow clones, file reads, and commit-push of a
//! single manifest file.

pub mod auth;
pub mod client;
pub mod error;
pub mod git;

pub use client::{CommitInfo, FileSnapshot, RepositoryClient, WorkingCopy};
pub use error::RepoError;
pub use git::{GitCli, GitIdentity};
