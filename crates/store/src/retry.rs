use std::time::Duration;

use krill_core::{Error, RetryClass};
use serde::{Deserialize, Serialize};

/// Conflicts are retried right away this many times before they back off like transient errors.
pub const MAX_IMMEDIATE_RETRIES: u32 = 3;

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self { Self { initial: Duration::from_secs(1), factor: 2, max: Duration::from_secs(300) } }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mult = (self.factor.max(1) as u64).saturating_pow(attempt.min(63));
        let ms = (self.initial.as_millis() as u64).saturating_mul(mult);
        Duration::from_millis(ms).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Immediate,
    After(Duration),
    /// Fatal for this generation; wait for the declaration to change.
    Stop,
}

/// Failure bookkeeping for one cluster.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    failures: u32,
    immediate: u32,
    fatal_generation: Option<i64>,
}

impl RetryTracker {
    pub fn record_failure(&mut self, policy: &BackoffPolicy, generation: i64, err: &Error) -> RetryDecision {
        match err.retry_class() {
            RetryClass::Fatal => {
                self.fatal_generation = Some(generation);
                RetryDecision::Stop
            }
            RetryClass::Immediate if self.immediate < MAX_IMMEDIATE_RETRIES => {
                self.immediate += 1;
                RetryDecision::Immediate
            }
            RetryClass::Immediate | RetryClass::Backoff => {
                let d = policy.delay(self.failures);
                self.failures = self.failures.saturating_add(1);
                RetryDecision::After(d)
            }
        }
    }

    pub fn record_success(&mut self) { *self = Self::default(); }

    /// A fatally failed generation is not retried until the declared generation moves.
    pub fn blocked(&self, generation: i64) -> bool { self.fatal_generation == Some(generation) }

    /// The last failure was fatal; callers check the current generation before retrying.
    pub fn fatal(&self) -> bool { self.fatal_generation.is_some() }

    pub fn failures(&self) -> u32 { self.failures }
}
