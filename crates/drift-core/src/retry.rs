//! Bounded retry with backoff
//!
//! Attempts are counted from 1 (the initial call). The delay before retry
//! `n` (0-indexed) grows according to the strategy and is capped.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// `base * attempt`
    Linear,
    /// `base * 2^attempt`
    #[default]
    Exponential,
}

/// Retry budget and backoff shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Backoff growth
    pub strategy: BackoffStrategy,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Cap on any single delay
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Policy capped at 30 s per delay
    #[must_use]
    pub fn new(max_attempts: u32, strategy: BackoffStrategy, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            strategy,
            base_delay_ms,
            max_delay_ms: 60_000,
        }
    }

    /// Single attempt, no retry
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, BackoffStrategy::Fixed, 0)
    }

    /// Settings/artifact writes: 3 attempts, exponential from 2s
    #[must_use]
    pub fn apply_default() -> Self {
        Self::new(3, BackoffStrategy::Exponential, 2_000)
    }

    /// Restart: 5 attempts, exponential from 2s
    #[must_use]
    pub fn restart_default() -> Self {
        Self::new(5, BackoffStrategy::Exponential, 2_000)
    }

    /// Secret lookups: 3 attempts, exponential from 500ms
    #[must_use]
    pub fn secret_default() -> Self {
        Self::new(3, BackoffStrategy::Exponential, 500)
    }

    /// Whether another attempt is allowed after `attempts_made`
    #[inline]
    #[must_use]
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before retry `retry` (0 = first retry)
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let ms = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(u64::from(retry) + 1),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(retry)),
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::apply_default()
    }
}
