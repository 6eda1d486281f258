//! Read-only look at an environment's manifest for `image-updater env show`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use updater_core::{read_image, Digest, EnvironmentId};
use updater_repo::CommitInfo;

use crate::engine::ReconciliationEngine;
use crate::error::EngineError;

/// What the manifest declares at the branch head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestInfo {
    pub environment: EnvironmentId,
    pub path: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    /// Last commit touching the manifest, when one is found within the
    /// configured history depth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change: Option<LastChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastChange {
    pub commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl From<CommitInfo> for LastChange {
    fn from(commit: CommitInfo) -> Self {
        Self {
            commit: commit.id,
            author: Some(commit.author),
            at: Some(commit.timestamp),
            summary: Some(commit.summary),
        }
    }
}

impl ReconciliationEngine {
    /// Clone the environment's repository and describe its manifest.
    ///
    /// Does not take the environment gate and touches neither the ledger nor
    /// the remote.
    pub async fn manifest_info(&self, id: &EnvironmentId) -> Result<ManifestInfo, EngineError> {
        let env = self.environment(id)?;
        let depth = self.options().history_depth;

        let inspect = async {
            let wc = self.repo().clone_repo(&env.repository).await?;
            let snapshot = self.repo().read_file(&wc, &env.manifest_path).await?;
            let image = read_image(&snapshot.content, &env.schema)?;

            let last_change = match self
                .repo()
                .last_modified(&wc, &env.manifest_path, depth)
                .await?
            {
                Some(commit) => Some(LastChange::from(commit)),
                None => snapshot.last_commit.map(|commit| LastChange {
                    commit,
                    author: None,
                    at: snapshot.last_commit_at,
                    summary: None,
                }),
            };

            Ok::<_, EngineError>(ManifestInfo {
                environment: env.id.clone(),
                path: env.manifest_path.display().to_string(),
                tag: image.tag,
                digest: image.digest,
                last_change,
            })
        };

        tokio::time::timeout(self.options().deadline, inspect)
            .await
            .map_err(|_| EngineError::Timeout(id.clone()))?
    }
}
