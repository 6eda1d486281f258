//! Dry-run planning for `image-updater plan`.
//!
//! Runs the evaluating phase and renders what the update would change.
//! Nothing is committed and the ledger is not touched.

use std::path::Path;

use serde::Serialize;
use similar::TextDiff;
use updater_core::{Digest, EnvironmentId, ManifestError};

use crate::engine::{Change, Evaluation, Intent, ReconciliationEngine};
use crate::error::EngineError;

/// What a reconciliation would do right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub environment: EnvironmentId,
    pub manifest_path: String,
    pub deployed_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_digest: Option<Digest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<PlannedChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedChange {
    pub tag: String,
    pub digest: Digest,
    pub unified_diff: String,
    /// Commit message the update would use.
    pub message: String,
}

impl Plan {
    pub fn is_up_to_date(&self) -> bool {
        self.change.is_none()
    }
}

impl ReconciliationEngine {
    /// Evaluate `id` and describe the update, without committing.
    pub async fn plan(&self, id: &EnvironmentId) -> Result<Plan, EngineError> {
        let env = self.environment(id)?;
        let intent = Intent::Latest { hint: None };
        let evaluation = tokio::time::timeout(self.options().deadline, self.evaluate(&env, &intent))
            .await
            .map_err(|_| EngineError::Timeout(id.clone()))??;

        let (deployed, change) = match evaluation {
            Evaluation::Current(deployed) => (deployed, None),
            Evaluation::Change(Change {
                snapshot,
                deployed,
                tag,
                digest,
                rewrite,
                ..
            }) => {
                // An unreadable manifest is what a real run would record.
                let content = rewrite?;
                let deployed = deployed.ok_or_else(|| ManifestError::MissingField {
                    path: env.schema.tag_path.clone(),
                })?;
                let change = PlannedChange {
                    unified_diff: render_diff(&env.manifest_path, &snapshot.content, &content),
                    message: self.options().git.render_message(&env, &tag),
                    tag,
                    digest,
                };
                (deployed, Some(change))
            }
        };

        Ok(Plan {
            environment: env.id.clone(),
            manifest_path: env.manifest_path.display().to_string(),
            deployed_tag: deployed.tag,
            deployed_digest: deployed.digest,
            change,
        })
    }
}

/// Unified diff of a manifest rewrite, with `a/` and `b/` headers.
pub fn render_diff(path: &Path, before: &[u8], after: &[u8]) -> String {
    let before = String::from_utf8_lossy(before);
    let after = String::from_utf8_lossy(after);
    let old_header = format!("a/{}", path.display());
    let new_header = format!("b/{}", path.display());
    TextDiff::from_lines(before.as_ref(), after.as_ref())
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string()
}
