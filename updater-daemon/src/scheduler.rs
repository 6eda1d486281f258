//! Per-environment poll timers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use updater_core::{Environment, EnvironmentId, Initiator};
use updater_engine::{ReconciliationEngine, TriggerStatus};

/// Floor for a poll period, so a zero interval cannot spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Owns one interval task per tracked environment.
pub struct Scheduler {
    engine: Arc<ReconciliationEngine>,
    tasks: BTreeMap<EnvironmentId, JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self {
            engine,
            tasks: BTreeMap::new(),
        }
    }

    /// Abort every poll task and start fresh ones for the current
    /// environment set. Runs already in flight are not cancelled.
    pub fn respawn(&mut self) {
        self.stop();
        for env in self.engine.environments() {
            let handle = tokio::spawn(poll_loop(self.engine.clone(), env.clone()));
            self.tasks.insert(env.id, handle);
        }
        info!(pollers = self.tasks.len(), "poll schedule started");
    }

    pub fn stop(&mut self) {
        for (_, handle) in std::mem::take(&mut self.tasks) {
            handle.abort();
        }
    }

    pub fn scheduled(&self) -> Vec<EnvironmentId> {
        self.tasks.keys().cloned().collect()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(engine: Arc<ReconciliationEngine>, env: Environment) {
    let period = env.poll_interval.max(MIN_POLL_INTERVAL);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        // The first tick completes immediately.
        interval.tick().await;
        match engine.try_reconcile(&env.id, Initiator::Poller, None) {
            Ok(TriggerStatus::Accepted) => debug!(environment = %env.id, "poll trigger accepted"),
            Ok(TriggerStatus::AlreadyInProgress) => {
                debug!(environment = %env.id, "poll skipped, reconciliation in progress")
            }
            Err(err) => {
                warn!(environment = %env.id, error = %err, "poll trigger failed, stopping poller");
                break;
            }
        }
    }
}
