//! Retry scheduling: exponential backoff with jitter and give-up rules.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::types::{FailureKind, after};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed in total, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Extra random delay, as a fraction (0.0-1.0) of the computed backoff.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            jitter: 0.2,
        }
    }
}

/// Why the scheduler stopped retrying.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    /// The failure kind can never succeed on retry.
    NotRetriable,
    /// `attempt_count` reached `max_attempts`.
    AttemptsExhausted,
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(DateTime<Utc>),
    GiveUp(GiveUpReason),
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff and no jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Backoff after the given (1-indexed) failed attempt, without jitter:
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`backoff`](Self::backoff) plus up to `jitter * backoff` of random
    /// delay, still capped at `max_delay`.
    pub fn jittered_backoff<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.backoff(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = delay.mul_f64(jitter * rng.random_range(0.0..1.0));
        (delay + extra).min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempt_count` attempts.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Decide what happens after attempt `attempt_count` failed with `kind`.
    pub fn decide(&self, attempt_count: u32, kind: FailureKind, now: DateTime<Utc>) -> RetryDecision {
        self.decide_with(attempt_count, kind, now, &mut rand::rng())
    }

    /// [`decide`](Self::decide) with a caller-supplied RNG.
    pub fn decide_with<R: Rng>(
        &self,
        attempt_count: u32,
        kind: FailureKind,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> RetryDecision {
        let retriable = matches!(
            kind,
            FailureKind::RateLimited | FailureKind::Timeout | FailureKind::Unknown
        );
        if !retriable {
            return RetryDecision::GiveUp(GiveUpReason::NotRetriable);
        }
        if !self.should_retry(attempt_count) {
            return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted);
        }
        RetryDecision::RetryAt(after(now, self.jittered_backoff(attempt_count, rng)))
    }
}
