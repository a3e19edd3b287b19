use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Job, JobId, NewJob, QueueStats, Result};

/// Durable collection of delivery jobs.
///
/// Implementations own the only synchronisation point of the engine: the
/// claim performed by [`JobStore::dequeue`] must be atomic at the storage
/// layer, so that concurrent callers never receive the same job.
///
/// Legal transitions are `{Pending, Failed} -> Processing -> {Sent, Failed}`,
/// plus `Processing -> Pending` for a transient failure that is retried
/// later. Anything else fails with [`StoreError::InvalidTransition`].
///
/// [`StoreError::InvalidTransition`]: crate::StoreError::InvalidTransition
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Prepare the backend (indexes, connectivity checks).
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Persist a new job as Pending and return its id.
    ///
    /// Priority defaults to Normal, the schedule to now and the attempt
    /// limit to [`DEFAULT_MAX_ATTEMPTS`](crate::DEFAULT_MAX_ATTEMPTS).
    async fn enqueue(&self, job: NewJob) -> Result<JobId>;

    /// Atomically claim the best eligible job.
    ///
    /// Eligible jobs are Pending or Failed, due (`scheduled_at <= now`) and
    /// below their failure limit. They are ordered by priority, then
    /// creation time. The claimed job is moved to Processing with `attempts`
    /// incremented, and returned in that state. `Ok(None)` means nothing is
    /// eligible.
    async fn dequeue(&self) -> Result<Option<Job>>;

    /// Processing -> Sent, recording which provider accepted the message.
    async fn mark_complete(
        &self,
        id: &JobId,
        provider: &str,
        provider_message_id: &str,
    ) -> Result<()>;

    /// Processing -> Failed, recording the error.
    ///
    /// `processed_at` is set so that retention cleanup can reclaim the job.
    /// When `retry_at` is given the job becomes claimable again from that
    /// instant, as long as it is below its failure limit.
    async fn mark_failed(
        &self,
        id: &JobId,
        message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Processing -> Pending with the schedule pushed out to `at`.
    ///
    /// Used for transient failures, so the next try goes through the same
    /// atomic claim as any other.
    async fn retry_later(&self, id: &JobId, message: &str, at: DateTime<Utc>) -> Result<()>;

    /// Look up a job. `Ok(None)` means no such job exists.
    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    async fn stats(&self) -> Result<QueueStats>;

    async fn pending_count(&self) -> Result<u64>;

    /// Delete Sent and Failed jobs processed more than `age` ago.
    ///
    /// Pending and Processing jobs are never removed, whatever their age.
    /// Returns the number of jobs deleted.
    async fn cleanup_older_than(&self, age: Duration) -> Result<u64>;
}
