//! Per-stage retry decisions

use std::time::Duration;

use docmaker_common::{BackoffKind, Config};
use docmaker_stages::StageError;

/// Delay schedule between attempts of the same stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base × 2^(retry-1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base, max } => {
                let exponent = retry.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
            }
        }
    }
}

/// Outcome of offering a stage failure to the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

/// Decides whether a failed stage is re-attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries on top of the first attempt
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(10),
            },
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        let base = Duration::from_millis(config.retry_base_delay_ms);
        let backoff = match config.retry_backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                max: Duration::from_millis(config.retry_max_delay_ms),
            },
        };
        Self {
            max_retries: config.retry_max_retries,
            backoff,
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Decide after `attempts` executions of a stage have failed, the last with `error`
    pub fn decide(&self, error: &StageError, attempts: u32) -> RetryDecision {
        if !error.is_retryable() || attempts >= self.max_attempts() {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            after: self.backoff.delay(attempts),
        }
    }
}
