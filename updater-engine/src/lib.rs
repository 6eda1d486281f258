//! Reconciliation engine: compares what the registry offers with what Git
//! declares, and commits the difference.
//!
//! - [`engine`]: [`ReconciliationEngine`], triggers and reports
//! - [`ledger`]: [`DeploymentLedger`] with memory and file backends
//! - [`gate`]: per-environment mutual exclusion
//! - [`backoff`]: retry delays for push conflicts
//! - [`plan`]: dry-run diffs
//! - [`inspect`]: the manifest as the repository holds it

pub mod backoff;
pub mod engine;
pub mod error;
pub mod gate;
pub mod inspect;
pub mod ledger;
pub mod plan;

pub use backoff::Backoff;
pub use engine::{
    EngineOptions, EvaluationFailure, Hint, Intent, ReconcileReport, ReconciliationEngine,
    TriggerStatus, MAX_TIE_LOOKUPS, REASON_INTERRUPTED,
};
pub use error::{EngineError, LedgerError};
pub use gate::{EnvironmentGate, GateGuard, Phase};
pub use inspect::{LastChange, ManifestInfo};
pub use ledger::{DeploymentLedger, FileLedger, LedgerFile, MemoryLedger};
pub use plan::{render_diff, Plan, PlannedChange};
