//! Jittered exponential backoff between push attempts.

use std::time::Duration;

use rand::Rng;
use updater_core::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.backoff_base(), config.backoff_max())
    }

    /// Ceiling for the wait after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    /// Wait between half the ceiling and the full ceiling.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        let half = ceiling / 2;
        let jitter = rand::thread_rng().gen_range(0..=ceiling - half);
        Duration::from_millis(half + jitter)
    }
}
