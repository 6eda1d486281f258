//! The reconciliation engine.
//!
//! One run per environment at a time:
//!
//! 1. **Evaluating**: clone, read the manifest, work out the deployed image and
//!    the candidate the registry offers (or the tag a user pinned). Equal
//!    digests end the run here without a record.
//! 2. **Updating**: append a `Pending` record, rewrite the manifest, commit and
//!    push it, retrying non-fast-forward rejections with backoff. Any failure
//!    from here on, a malformed manifest included, lands in the record.
//! 3. The record moves to its terminal outcome and the gate is released.
//!
//! Every run is bounded by the configured deadline. Runs that stop before a
//! record exists are kept as the environment's [`EvaluationFailure`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use updater_core::types::{REASON_CONFLICT_EXHAUSTED, REASON_TIMEOUT};
use updater_core::{
    read_image, DeployedImage, DeploymentId, DeploymentRecord, Digest, EngineConfig, Environment,
    EnvironmentId, ErrorKind, GitConfig, Initiator, ManifestMutation, Outcome, Settings,
};
use updater_registry::RegistryClient;
use updater_repo::{FileSnapshot, RepositoryClient, WorkingCopy};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::error::{EngineError, LedgerError};
use crate::gate::{EnvironmentGate, GateGuard, Phase};
use crate::ledger::DeploymentLedger;

/// Failure reason for records left pending by a process that died mid-run.
pub const REASON_INTERRUPTED: &str = "interrupted";

/// Upper bound on `tag_info` lookups when many tags share the top rank.
/// The highest names are resolved; the rest are not considered.
pub const MAX_TIE_LOOKUPS: usize = 10;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_push_attempts: u32,
    pub backoff: Backoff,
    pub deadline: Duration,
    pub history_depth: u32,
    pub git: GitConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new(&EngineConfig::default(), GitConfig::default())
    }
}

impl EngineOptions {
    pub fn new(engine: &EngineConfig, git: GitConfig) -> Self {
        Self {
            max_push_attempts: engine.max_push_attempts.max(1),
            backoff: Backoff::from_config(engine),
            deadline: engine.deadline(),
            history_depth: engine.history_depth,
            git,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.engine, settings.git.clone())
    }
}

/// A tag/digest pair announced by a registry push notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
    pub tag: String,
    pub digest: Digest,
}

/// What a run converges the manifest to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// The policy's best tag. A hint whose digest is already deployed
    /// settles the run without listing tags.
    Latest { hint: Option<Hint> },
    /// Exactly this tag, even when it ranks below the deployed one.
    Pin { tag: String },
}

impl Intent {
    fn is_pin(&self) -> bool {
        matches!(self, Intent::Pin { .. })
    }
}

/// Immediate answer to a non-blocking trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Accepted,
    AlreadyInProgress,
}

/// How an awaited run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileReport {
    /// Nothing to change; no record was written.
    UpToDate {
        environment: EnvironmentId,
        tag: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        digest: Option<Digest>,
    },
    /// A deployment was attempted; the record holds its terminal outcome.
    Recorded { record: DeploymentRecord },
    /// The run stopped before any record existed.
    EvaluationFailed {
        environment: EnvironmentId,
        kind: ErrorKind,
        message: String,
    },
}

/// The latest run of an environment that ended without a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// What a manifest should be rewritten to.
#[derive(Debug, Clone)]
struct Target {
    tag: String,
    digest: Digest,
    /// Pinned targets stand even when the remote carries a higher tag.
    pinned: bool,
}

/// A difference the evaluating phase found.
pub(crate) struct Change {
    pub wc: WorkingCopy,
    pub snapshot: FileSnapshot,
    /// `None` when the manifest could not be read.
    pub deployed: Option<DeployedImage>,
    pub tag: String,
    pub digest: Digest,
    /// The rewritten manifest, or why it could not be produced.
    pub rewrite: Result<Vec<u8>, EngineError>,
}

/// Result of the evaluating phase.
pub(crate) enum Evaluation {
    /// The manifest already declares the image to deploy.
    Current(DeployedImage),
    Change(Change),
}

/// The in-flight record of a run, visible to the deadline handler.
#[derive(Debug, Default)]
struct InFlight {
    slot: Mutex<Option<(DeploymentId, u32)>>,
}

impl InFlight {
    fn with<R>(&self, f: impl FnOnce(&mut Option<(DeploymentId, u32)>) -> R) -> R {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut slot)
    }

    fn begin(&self, id: DeploymentId) {
        self.with(|slot| *slot = Some((id, 0)));
    }

    fn attempt(&self, attempt: u32) {
        self.with(|slot| {
            if let Some((_, attempts)) = slot {
                *attempts = attempt;
            }
        });
    }

    fn take(&self) -> Option<(DeploymentId, u32)> {
        self.with(Option::take)
    }
}

/// Outcome of re-reading the remote after a rejected push.
enum Reread {
    /// Another writer already deployed the target, or something newer.
    Superseded(DeployedImage),
    Retry { wc: WorkingCopy, content: Vec<u8> },
}

/// How the updating phase ended.
struct Pushed {
    outcome: Outcome,
    commit: Option<String>,
    attempts: u32,
    /// What the remote declares afterwards, when known.
    deployed: Option<DeployedImage>,
}

impl Pushed {
    fn failed(reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            outcome: Outcome::failed(reason),
            commit: None,
            attempts,
            deployed: None,
        }
    }
}

pub type EnvironmentCache = RwLock<HashMap<EnvironmentId, Environment>>;

pub struct ReconciliationEngine {
    registry: Arc<dyn RegistryClient>,
    repo: Arc<dyn RepositoryClient>,
    ledger: Arc<dyn DeploymentLedger>,
    gate: EnvironmentGate,
    environments: EnvironmentCache,
    failures: RwLock<HashMap<EnvironmentId, EvaluationFailure>>,
    options: EngineOptions,
}

impl ReconciliationEngine {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        repo: Arc<dyn RepositoryClient>,
        ledger: Arc<dyn DeploymentLedger>,
        options: EngineOptions,
        environments: Vec<Environment>,
    ) -> Self {
        Self {
            registry,
            repo,
            ledger,
            gate: EnvironmentGate::new(),
            environments: RwLock::new(
                environments.into_iter().map(|e| (e.id.clone(), e)).collect(),
            ),
            failures: RwLock::new(HashMap::new()),
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn gate(&self) -> &EnvironmentGate {
        &self.gate
    }

    pub fn ledger(&self) -> &Arc<dyn DeploymentLedger> {
        &self.ledger
    }

    pub(crate) fn repo(&self) -> &Arc<dyn RepositoryClient> {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Environment set
    // -----------------------------------------------------------------------

    /// Tracked environments, sorted by id.
    pub fn environments(&self) -> Vec<Environment> {
        let cache = self.environments.read().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<Environment> = cache.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn environment(&self, id: &EnvironmentId) -> Result<Environment, EngineError> {
        self.environments
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownEnvironment(id.clone()))
    }

    /// Swap in a reloaded environment set. Runs already in flight keep the
    /// definition they started with. The last observed image carries over for
    /// environments that still track the same image.
    pub fn replace_environments(&self, environments: Vec<Environment>) {
        let mut cache = self.environments.write().unwrap_or_else(|p| p.into_inner());
        let next: HashMap<EnvironmentId, Environment> = environments
            .into_iter()
            .map(|mut env| {
                if env.current.is_none() {
                    env.current = cache
                        .get(&env.id)
                        .filter(|old| old.image == env.image)
                        .and_then(|old| old.current.clone());
                }
                (env.id.clone(), env)
            })
            .collect();
        info!(environments = next.len(), "environment set replaced");
        *cache = next;
    }

    fn remember(&self, id: &EnvironmentId, deployed: DeployedImage) {
        let mut cache = self.environments.write().unwrap_or_else(|p| p.into_inner());
        if let Some(env) = cache.get_mut(id) {
            env.current = Some(deployed);
        }
    }

    fn evaluation_failed(&self, env: &Environment, kind: ErrorKind, message: String) -> ReconcileReport {
        self.failures
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                env.id.clone(),
                EvaluationFailure {
                    kind,
                    message: message.clone(),
                    at: Utc::now(),
                },
            );
        ReconcileReport::EvaluationFailed {
            environment: env.id.clone(),
            kind,
            message,
        }
    }

    fn clear_failure(&self, id: &EnvironmentId) {
        self.failures
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status(&self, id: &EnvironmentId) -> Phase {
        self.gate.phase(id)
    }

    /// Why the environment's latest run stopped before creating a record.
    /// Cleared by the next run that gets further.
    pub fn last_failure(&self, id: &EnvironmentId) -> Option<EvaluationFailure> {
        self.failures
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Deployment records for `id`, newest first, at most `limit` of them.
    pub fn history(
        &self,
        id: &EnvironmentId,
        limit: Option<usize>,
    ) -> Result<Vec<DeploymentRecord>, EngineError> {
        let mut records = self.ledger.list_by_environment(id)?;
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Registry tags for the environment's image, best first under its policy.
    pub async fn list_tags(&self, id: &EnvironmentId) -> Result<Vec<String>, EngineError> {
        let env = self.environment(id)?;
        let tags = self.registry.list_tags(&env.image).await?;
        Ok(env.policy.sort_descending(&tags))
    }

    /// Fail every pending record left behind by a previous process.
    ///
    /// Only call this before any run has started in this process.
    pub fn recover_interrupted(&self) -> Result<usize, EngineError> {
        let mut recovered = 0;
        for env in self.environments() {
            if self.gate.phase(&env.id) != Phase::Idle {
                continue;
            }
            if let Some(record) = self.ledger.pending(&env.id)? {
                warn!(environment = %env.id, deployment = %record.id, "failing deployment interrupted by a restart");
                self.finish(
                    &record.id,
                    Outcome::failed(REASON_INTERRUPTED),
                    None,
                    record.attempts,
                )?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Claim the environment and run in the background.
    ///
    /// Returns `AlreadyInProgress` immediately when another run holds it.
    pub fn try_reconcile(
        self: &Arc<Self>,
        id: &EnvironmentId,
        initiator: Initiator,
        hint: Option<Hint>,
    ) -> Result<TriggerStatus, EngineError> {
        self.try_start(id, initiator, Intent::Latest { hint })
    }

    /// Like [`try_reconcile`](Self::try_reconcile), deploying `tag` instead
    /// of the policy's choice.
    pub fn try_deploy_tag(
        self: &Arc<Self>,
        id: &EnvironmentId,
        initiator: Initiator,
        tag: impl Into<String>,
    ) -> Result<TriggerStatus, EngineError> {
        self.try_start(id, initiator, Intent::Pin { tag: tag.into() })
    }

    /// Non-blocking trigger for any [`Intent`].
    pub fn try_start(
        self: &Arc<Self>,
        id: &EnvironmentId,
        initiator: Initiator,
        intent: Intent,
    ) -> Result<TriggerStatus, EngineError> {
        let env = self.environment(id)?;
        let Some(guard) = self.gate.try_acquire(id) else {
            debug!(environment = %id, %initiator, "trigger ignored, reconciliation in progress");
            return Ok(TriggerStatus::AlreadyInProgress);
        };

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let id = env.id.clone();
            if let Err(e) = engine.run_guarded(guard, env, initiator, intent).await {
                error!(environment = %id, error = %e, "reconciliation aborted");
            }
        });
        Ok(TriggerStatus::Accepted)
    }

    /// Run to completion and report the result.
    pub async fn reconcile(
        &self,
        id: &EnvironmentId,
        initiator: Initiator,
        hint: Option<Hint>,
    ) -> Result<ReconcileReport, EngineError> {
        self.run_intent(id, initiator, Intent::Latest { hint }).await
    }

    /// Deploy `tag` to completion, bypassing the tag policy.
    pub async fn deploy_tag(
        &self,
        id: &EnvironmentId,
        initiator: Initiator,
        tag: impl Into<String>,
    ) -> Result<ReconcileReport, EngineError> {
        self.run_intent(id, initiator, Intent::Pin { tag: tag.into() }).await
    }

    pub async fn run_intent(
        &self,
        id: &EnvironmentId,
        initiator: Initiator,
        intent: Intent,
    ) -> Result<ReconcileReport, EngineError> {
        let env = self.environment(id)?;
        let guard = self
            .gate
            .try_acquire(id)
            .ok_or_else(|| EngineError::AlreadyInProgress(id.clone()))?;
        self.run_guarded(guard, env, initiator, intent).await
    }

    async fn run_guarded(
        &self,
        guard: GateGuard,
        env: Environment,
        initiator: Initiator,
        intent: Intent,
    ) -> Result<ReconcileReport, EngineError> {
        info!(environment = %env.id, %initiator, ?intent, "reconciliation started");
        let in_flight = InFlight::default();
        let run = self.run(&guard, &env, initiator, &intent, &in_flight);
        match tokio::time::timeout(self.options.deadline, run).await {
            Ok(report) => report,
            Err(_) => self.expire(&env, &in_flight),
        }
    }

    /// Deadline handler. The run's future has already been dropped.
    fn expire(&self, env: &Environment, in_flight: &InFlight) -> Result<ReconcileReport, EngineError> {
        warn!(
            environment = %env.id,
            deadline_secs = self.options.deadline.as_secs(),
            "reconciliation exceeded its deadline"
        );
        match in_flight.take() {
            Some((id, attempts)) => {
                let record = self.finish(&id, Outcome::failed(REASON_TIMEOUT), None, attempts)?;
                self.clear_failure(&env.id);
                Ok(ReconcileReport::Recorded { record })
            }
            None => Ok(self.evaluation_failed(
                env,
                ErrorKind::Timeout,
                EngineError::Timeout(env.id.clone()).to_string(),
            )),
        }
    }

    async fn run(
        &self,
        guard: &GateGuard,
        env: &Environment,
        initiator: Initiator,
        intent: &Intent,
        in_flight: &InFlight,
    ) -> Result<ReconcileReport, EngineError> {
        guard.set(Phase::Evaluating);
        let change = match self.evaluate(env, intent).await {
            Ok(Evaluation::Change(change)) => change,
            Ok(Evaluation::Current(deployed)) => {
                info!(environment = %env.id, tag = %deployed.tag, "already up to date");
                self.clear_failure(&env.id);
                self.remember(&env.id, deployed.clone());
                return Ok(ReconcileReport::UpToDate {
                    environment: env.id.clone(),
                    tag: deployed.tag,
                    digest: deployed.digest,
                });
            }
            Err(e) => {
                warn!(environment = %env.id, kind = %e.kind(), error = %e, "evaluation failed");
                return Ok(self.evaluation_failed(env, e.kind(), e.to_string()));
            }
        };

        let Change {
            wc,
            deployed,
            tag,
            digest,
            rewrite,
            ..
        } = change;

        guard.set(Phase::Updating);
        let id = DeploymentId::from(Uuid::new_v4().to_string());
        let record = DeploymentRecord::pending(
            id.clone(),
            env.id.clone(),
            deployed.as_ref(),
            tag.clone(),
            digest.clone(),
            initiator,
        );
        self.ledger.append(record).map_err(|e| match e {
            LedgerError::PendingExists(busy) => EngineError::AlreadyInProgress(busy),
            other => {
                error!(environment = %env.id, error = %other, "ledger rejected new deployment");
                EngineError::Ledger(other)
            }
        })?;
        in_flight.begin(id.clone());
        self.clear_failure(&env.id);
        info!(
            environment = %env.id,
            deployment = %id,
            from = deployed.as_ref().map_or("-", |d| d.tag.as_str()),
            to = %tag,
            "deploying new tag"
        );

        let target = Target {
            tag,
            digest,
            pinned: intent.is_pin(),
        };
        let pushed = match rewrite {
            Ok(content) => self.push_with_retry(env, wc, &target, content, in_flight).await,
            Err(e) => Pushed::failed(e.reason(), 0),
        };
        let record = self.finish(&id, pushed.outcome, pushed.commit, pushed.attempts)?;
        in_flight.take();

        match &record.outcome {
            Outcome::Succeeded | Outcome::ConflictRetried => {
                guard.set(Phase::Committed);
                if let Some(deployed) = pushed.deployed {
                    self.remember(&env.id, deployed);
                }
                info!(environment = %env.id, deployment = %id, outcome = %record.outcome, attempts = record.attempts, "deployment finished");
            }
            Outcome::Failed { reason } => {
                guard.set(Phase::Failed);
                warn!(environment = %env.id, deployment = %id, %reason, attempts = record.attempts, "deployment failed");
            }
            Outcome::Pending => {}
        }
        Ok(ReconcileReport::Recorded { record })
    }

    /// Commit and push `content`, re-reading the remote after every rejection.
    async fn push_with_retry(
        &self,
        env: &Environment,
        mut wc: WorkingCopy,
        target: &Target,
        mut content: Vec<u8>,
        in_flight: &InFlight,
    ) -> Pushed {
        let message = self.options.git.render_message(env, &target.tag);
        let max = self.options.max_push_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            in_flight.attempt(attempt);
            match self
                .repo
                .commit_and_push(&wc, &env.manifest_path, &content, &message)
                .await
            {
                Ok(commit) => {
                    return Pushed {
                        outcome: Outcome::Succeeded,
                        commit: Some(commit),
                        attempts: attempt,
                        deployed: Some(DeployedImage {
                            tag: target.tag.clone(),
                            digest: Some(target.digest.clone()),
                            observed_at: Utc::now(),
                        }),
                    }
                }
                Err(e) if e.kind().is_recoverable() => {
                    info!(environment = %env.id, attempt, max, "push rejected, remote moved");
                }
                Err(e) => return Pushed::failed(EngineError::from(e).reason(), attempt),
            }

            drop(wc);
            match self.reread(env, target).await {
                Ok(Reread::Superseded(observed)) => {
                    info!(environment = %env.id, tag = %target.tag, remote = %observed.tag, "remote already carries the target or newer");
                    return Pushed {
                        outcome: Outcome::ConflictRetried,
                        commit: None,
                        attempts: attempt,
                        deployed: Some(observed),
                    };
                }
                Ok(Reread::Retry {
                    wc: fresh,
                    content: rewritten,
                }) => {
                    wc = fresh;
                    content = rewritten;
                }
                Err(e) => return Pushed::failed(e.reason(), attempt),
            }

            if attempt >= max {
                return Pushed::failed(REASON_CONFLICT_EXHAUSTED, attempt);
            }
            let delay = self.options.backoff.delay(attempt);
            debug!(environment = %env.id, attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
            tokio::time::sleep(delay).await;
        }
    }

    async fn reread(&self, env: &Environment, target: &Target) -> Result<Reread, EngineError> {
        let wc = self.repo.clone_repo(&env.repository).await?;
        let snapshot = self.repo.read_file(&wc, &env.manifest_path).await?;
        let deployed = self.deployed_image(env, &snapshot.content).await?;

        let newer = !target.pinned
            && env.policy.compare(&deployed.tag, &target.tag) == Ordering::Greater;
        if deployed.digest.as_ref() == Some(&target.digest) || newer {
            return Ok(Reread::Superseded(deployed));
        }
        let content = ManifestMutation::new(&env.schema, &target.tag, Some(&target.digest))
            .apply(&snapshot.content)?;
        if content == snapshot.content {
            return Ok(Reread::Superseded(deployed));
        }
        Ok(Reread::Retry { wc, content })
    }

    fn finish(
        &self,
        id: &DeploymentId,
        outcome: Outcome,
        commit: Option<String>,
        attempts: u32,
    ) -> Result<DeploymentRecord, EngineError> {
        self.ledger
            .update_outcome(id, outcome, commit, attempts)
            .map_err(|e| {
                error!(deployment = %id, error = %e, "ledger rejected outcome update");
                EngineError::Ledger(e)
            })
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Clone, read the manifest and decide whether anything needs to change.
    ///
    /// A manifest that cannot be read is not an evaluation failure: the
    /// registry still names a candidate, and the run records the problem.
    pub(crate) async fn evaluate(
        &self,
        env: &Environment,
        intent: &Intent,
    ) -> Result<Evaluation, EngineError> {
        let wc = self.repo.clone_repo(&env.repository).await?;
        let snapshot = self.repo.read_file(&wc, &env.manifest_path).await?;
        let deployed = match self.deployed_image(env, &snapshot.content).await {
            Err(e) if e.kind() == ErrorKind::ManifestMalformed => Err(e),
            other => Ok(other?),
        };

        let (tag, digest) = match intent {
            Intent::Pin { tag } => {
                let digest = self.registry.resolve_digest(&env.image, tag).await?;
                (tag.clone(), digest)
            }
            Intent::Latest { hint } => {
                if let (Some(hint), Ok(current)) = (hint, &deployed) {
                    if current.digest.as_ref() == Some(&hint.digest) {
                        debug!(environment = %env.id, hinted = %hint.tag, "hinted digest already deployed");
                        return Ok(Evaluation::Current(current.clone()));
                    }
                }
                self.candidate(env).await?
            }
        };

        let deployed = match deployed {
            Ok(deployed) => deployed,
            Err(e) => {
                warn!(environment = %env.id, error = %e, "manifest unreadable");
                return Ok(Evaluation::Change(Change {
                    wc,
                    snapshot,
                    deployed: None,
                    tag,
                    digest,
                    rewrite: Err(e),
                }));
            }
        };
        if deployed.digest.as_ref() == Some(&digest) {
            return Ok(Evaluation::Current(deployed));
        }
        if !intent.is_pin() && env.policy.compare(&tag, &deployed.tag) == Ordering::Less {
            debug!(environment = %env.id, deployed = %deployed.tag, candidate = %tag, "registry offers nothing newer");
            return Ok(Evaluation::Current(deployed));
        }

        let rewrite = ManifestMutation::new(&env.schema, &tag, Some(&digest))
            .apply(&snapshot.content)
            .map_err(EngineError::from);
        if matches!(&rewrite, Ok(content) if *content == snapshot.content) {
            return Ok(Evaluation::Current(deployed));
        }
        Ok(Evaluation::Change(Change {
            wc,
            snapshot,
            deployed: Some(deployed),
            tag,
            digest,
            rewrite,
        }))
    }

    /// The image a manifest declares, with its digest.
    ///
    /// A deployed tag the registry no longer knows has no digest, so any
    /// candidate counts as a change.
    async fn deployed_image(
        &self,
        env: &Environment,
        content: &[u8],
    ) -> Result<DeployedImage, EngineError> {
        let image = read_image(content, &env.schema)?;
        if let Some(repository) = &image.repository {
            if !env.image.matches_repository(repository) {
                return Err(EngineError::ImageMismatch {
                    expected: env.image.clone(),
                    found: repository.clone(),
                });
            }
        }

        let digest = match image.digest {
            Some(digest) => Some(digest),
            None => match self.registry.resolve_digest(&env.image, &image.tag).await {
                Ok(digest) => Some(digest),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::RegistryNotFound | ErrorKind::DigestUnavailable
                    ) =>
                {
                    debug!(environment = %env.id, tag = %image.tag, error = %e, "deployed tag has no digest");
                    None
                }
                Err(e) => return Err(e.into()),
            },
        };

        Ok(DeployedImage {
            tag: image.tag,
            digest,
            observed_at: Utc::now(),
        })
    }

    /// The policy's best registry tag with its digest.
    async fn candidate(&self, env: &Environment) -> Result<(String, Digest), EngineError> {
        let tags = self.registry.list_tags(&env.image).await?;
        match env.policy.top_candidates(&tags).as_slice() {
            [] => Err(EngineError::NoCandidate(env.image.clone())),
            [only] => {
                let digest = self.registry.resolve_digest(&env.image, only).await?;
                Ok((only.clone(), digest))
            }
            tied => {
                // `top_candidates` is name-sorted; keep the highest names.
                let lookups = &tied[tied.len().saturating_sub(MAX_TIE_LOOKUPS)..];
                if lookups.len() < tied.len() {
                    debug!(environment = %env.id, tied = tied.len(), resolved = lookups.len(), "too many tied tags, resolving a subset");
                }
                let mut infos = Vec::with_capacity(lookups.len());
                for tag in lookups {
                    infos.push(self.registry.tag_info(&env.image, tag).await?);
                }
                let best = env
                    .policy
                    .select(&infos)
                    .ok_or_else(|| EngineError::NoCandidate(env.image.clone()))?;
                Ok((best.name.clone(), best.digest.clone()))
            }
        }
    }
}
