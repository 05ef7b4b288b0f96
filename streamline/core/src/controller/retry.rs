//! Retry Policy
//!
//! Exponential backoff with an attempt budget. The index only resets when
//! a new logical operation begins, never between retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry budget and backoff shape
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt (total attempts = this + 1)
    pub max_attempts: u32,

    /// Backoff unit; the n-th retry waits `base_delay * 2^n`
    #[serde(with = "millis")]
    pub base_delay: Duration,

    /// Upper bound for a single backoff
    #[serde(with = "millis")]
    pub max_delay: Duration,

    /// Add up to 25% random jitter to each backoff
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff for the given attempt index (`base_delay * 2^index`, capped)
    pub fn backoff_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 2f64.powi(i32::try_from(attempt_index).unwrap_or(i32::MAX));
        let base = self.base_delay.as_millis() as f64 * factor;
        let capped = base.min(self.max_delay.as_millis() as f64);

        let duration_ms = if self.jitter {
            // Add up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(duration_ms)
    }
}

/// Per-operation retry counter
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt_index: u32,
}

impl RetryPolicy {
    /// Fresh policy for a new operation
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt_index: 0,
        }
    }

    /// Retries spent so far (0 during the initial attempt)
    #[must_use]
    pub fn attempt_index(&self) -> u32 {
        self.attempt_index
    }

    /// Configured budget
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether another attempt fits in the budget
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.attempt_index < self.config.max_attempts
    }

    /// Spend one retry and return how long to wait before it
    pub fn advance(&mut self) -> Duration {
        self.attempt_index = self.attempt_index.saturating_add(1);
        self.config.backoff_for_attempt(self.attempt_index)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
