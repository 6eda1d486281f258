//! Per-environment mutual exclusion.
//!
//! At most one reconciliation runs per environment. Acquisition never blocks:
//! a busy environment yields `None` immediately. The returned [`GateGuard`]
//! releases the environment when dropped, including on panic or when the
//! owning future is cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use updater_core::EnvironmentId;

/// Where an environment is in its reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Evaluating,
    Updating,
    Committed,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Phase::Idle => "idle",
            Phase::Evaluating => "evaluating",
            Phase::Updating => "updating",
            Phase::Committed => "committed",
            Phase::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvironmentGate {
    active: Arc<Mutex<HashMap<EnvironmentId, Phase>>>,
}

impl EnvironmentGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EnvironmentId, Phase>> {
        // The map holds plain values; a panic elsewhere cannot corrupt it.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `environment`, moving it to `Evaluating`. `None` if it is busy.
    pub fn try_acquire(&self, environment: &EnvironmentId) -> Option<GateGuard> {
        let mut active = self.lock();
        if active.contains_key(environment) {
            return None;
        }
        active.insert(environment.clone(), Phase::Evaluating);
        Some(GateGuard {
            gate: self.clone(),
            environment: environment.clone(),
        })
    }

    pub fn phase(&self, environment: &EnvironmentId) -> Phase {
        self.lock().get(environment).copied().unwrap_or(Phase::Idle)
    }

    /// Environments currently held, sorted by id.
    pub fn active(&self) -> Vec<(EnvironmentId, Phase)> {
        let mut held: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, phase)| (id.clone(), *phase))
            .collect();
        held.sort_by(|a, b| a.0.cmp(&b.0));
        held
    }
}

/// Exclusive claim on one environment.
#[derive(Debug)]
pub struct GateGuard {
    gate: EnvironmentGate,
    environment: EnvironmentId,
}

impl GateGuard {
    pub fn environment(&self) -> &EnvironmentId {
        &self.environment
    }

    pub fn set(&self, phase: Phase) {
        if let Some(slot) = self.gate.lock().get_mut(&self.environment) {
            *slot = phase;
        }
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.lock().remove(&self.environment);
    }
}
