//! Configuration for reconnection behaviour.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff between reconnection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Each delay is fuzzed uniformly within ±factor of its nominal value
    pub randomisation_factor: f64,
    /// Give up after this many consecutive attempts (None = never)
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            randomisation_factor: 0.5,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Nominal (unfuzzed) delay before attempt `attempt` (0-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}
