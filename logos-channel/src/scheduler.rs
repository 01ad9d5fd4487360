//! Reconnection scheduling.
//!
//! The multiplexer asks its [`Scheduler`] when to retry after losing its
//! session. The scheduler only decides; whoever drives the multiplexer runs
//! the returned [`ReconnectCommand`] once the delay has elapsed.

use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::config::BackoffConfig;

/// A pending reconnection, to be handed back to `Multiplexer::execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectCommand {
    pub(crate) tag: u64,
}

impl ReconnectCommand {
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

/// Decides when reconnection attempts run.
pub trait Scheduler {
    /// Delay before the next attempt, or `None` to give up.
    fn schedule(&mut self) -> Option<Duration>;

    /// The connection proved healthy; start the next backoff from scratch.
    fn reset(&mut self);

    /// Attempts made since the last reset.
    fn attempts(&self) -> u32;
}

/// Retries straight away, forever.
#[derive(Debug, Default)]
pub struct ImmediateScheduler {
    attempts: u32,
}

impl Scheduler for ImmediateScheduler {
    fn schedule(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        Some(Duration::ZERO)
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Exponential backoff with random fuzz, so clients that lost the same
/// server do not reconnect in lockstep.
#[derive(Debug)]
pub struct BackoffScheduler {
    config: BackoffConfig,
    attempts: u32,
    rng: ChaCha20Rng,
}

impl BackoffScheduler {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_rng(config, ChaCha20Rng::from_rng(&mut rand::rng()))
    }

    /// Deterministic fuzz, for tests.
    pub fn with_seed(config: BackoffConfig, seed: u64) -> Self {
        Self::with_rng(config, ChaCha20Rng::seed_from_u64(seed))
    }

    fn with_rng(config: BackoffConfig, rng: ChaCha20Rng) -> Self {
        Self {
            config,
            attempts: 0,
            rng,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for BackoffScheduler {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl Scheduler for BackoffScheduler {
    fn schedule(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempts >= max {
                log::warn!("Giving up reconnecting after {} attempts", self.attempts);
                return None;
            }
        }
        let nominal = self.config.nominal_delay(self.attempts).as_millis() as f64;
        let factor = self.config.randomisation_factor.clamp(0.0, 1.0);
        let fuzz = 1.0 - factor + 2.0 * factor * self.rng.random::<f64>();
        self.attempts += 1;

        let delay = Duration::from_millis((nominal * fuzz) as u64);
        log::debug!("Reconnect attempt {} in {delay:?}", self.attempts);
        Some(delay)
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}
