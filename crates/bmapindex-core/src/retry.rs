//! Exponential reconnect backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first reconnect, in milliseconds.
    pub initial_ms: u64,
    /// Maximum delay (caps exponential growth), in milliseconds.
    pub max_ms: u64,
    /// Multiplier applied to the delay on each further attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// No delay at all; for tests and replays.
    pub fn immediate() -> Self {
        Self {
            initial_ms: 0,
            max_ms: 0,
            multiplier: 1.0,
        }
    }
}

/// Stateless backoff policy — computes the delay given the attempt number.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th reconnect (1-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let base_ms = self.config.initial_ms as f64 * self.config.multiplier.powi(exp);
        let capped = base_ms.min(self.config.max_ms as f64);
        Duration::from_millis(capped as u64)
    }
}
