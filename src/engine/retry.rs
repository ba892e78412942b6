// Retry and dead-letter policy for failed runs

//! # Retry & Dead-Letter Policy
//!
//! Decides what happens after a run fails: schedule another attempt with
//! exponential backoff, or give up and move the run to the dead-letter queue.
//!
//! Backoff is `base * 2^(attempt - 1)`, capped at a maximum delay, plus up to
//! 10% random jitter so a burst of failures does not retry in lockstep.
//!
//! A dead-lettered run keeps `Failed` status; its error message gains the
//! `[DLQ] ` tag that makes it visible in the dead-letter listing. DLQ runs
//! are never retried by the scheduler loop - only an explicit human
//! `retry_dlq` (which resets the attempt counter to 1) or a pipeline
//! re-execution revives the workflow.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// What to do with a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum RetryDecision {
    /// Dispatch attempt `attempt_number` at `next_attempt_at`
    Retry {
        attempt_number: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempts exhausted; tag the run for the dead-letter queue
    DeadLetter,
}

/// Backoff and attempt-cap policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a failure chain dead-letters (>= 1)
    pub max_attempts: u32,
    /// Delay before attempt 2
    pub base_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::seconds(30),
            max_delay: Duration::minutes(15),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Decide the fate of a failure at `attempt_number`, honoring a
    /// per-workflow attempt cap when one is configured.
    pub fn on_failure(
        &self,
        attempt_number: u32,
        workflow_max_attempts: Option<u32>,
    ) -> RetryDecision {
        let cap = workflow_max_attempts.unwrap_or(self.max_attempts).max(1);
        if attempt_number >= cap {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                attempt_number: attempt_number + 1,
                next_attempt_at: Utc::now() + self.delay_for(attempt_number),
            }
        }
    }

    /// Backoff before the attempt that follows `attempt_number`.
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(16);
        let base_ms = self.base_delay.num_milliseconds().max(1);
        let scaled_ms = base_ms.saturating_mul(1i64 << exponent);
        let capped_ms = scaled_ms.min(self.max_delay.num_milliseconds());
        let with_jitter = if self.jitter {
            let jitter_ms = (rand::random::<f64>() * capped_ms as f64 * 0.1) as i64;
            capped_ms + jitter_ms
        } else {
            capped_ms
        };
        Duration::milliseconds(with_jitter)
    }
}
