//! What happens to a job after a failed attempt.
//!
//! The decision depends on the failure class and on the job's remaining
//! failure budget (`failures` against `max_attempts`):
//!
//! | Failure   | Budget left | Result                                          |
//! |-----------|-------------|-------------------------------------------------|
//! | temporary | yes         | back to Pending after `min(attempts × step, cap)` |
//! | permanent | yes         | Failed, reclaimable after `retry_delay`         |
//! | either    | no          | Failed for good                                 |

use std::time::Duration;

use herald_store::Job;

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to Pending, due after the delay.
    Backoff(Duration),
    /// Mark the job Failed but reclaimable after the delay.
    RetryAfter(Duration),
    /// Mark the job Failed with no further attempts.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backoff per attempt made for temporary failures.
    pub backoff_step: Duration,

    /// Ceiling for the temporary-failure backoff.
    pub backoff_cap: Duration,

    /// Wait before a permanently failed job is tried again.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_step: defaults::backoff_step(),
            backoff_cap: defaults::backoff_cap(),
            retry_delay: defaults::retry_delay(),
        }
    }
}

impl RetryPolicy {
    /// `min(attempts × backoff_step, backoff_cap)`
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        self.backoff_step
            .saturating_mul(attempts)
            .min(self.backoff_cap)
    }

    #[must_use]
    pub fn decide(&self, job: &Job, temporary: bool) -> RetryDecision {
        if !job.has_retries_left() {
            RetryDecision::GiveUp
        } else if temporary {
            RetryDecision::Backoff(self.backoff(job.attempts))
        } else {
            RetryDecision::RetryAfter(self.retry_delay)
        }
    }
}

pub(crate) mod defaults {
    use std::time::Duration;

    pub const fn backoff_step() -> Duration {
        Duration::from_secs(30)
    }

    pub const fn backoff_cap() -> Duration {
        Duration::from_secs(5 * 60)
    }

    pub const fn retry_delay() -> Duration {
        Duration::from_secs(5 * 60)
    }
}
