use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    Job, JobId, JobStatus, NewJob, QueueStats, Result, StoreError, job::cutoff,
    r#trait::JobStore,
};

#[derive(Debug)]
struct Entry {
    /// Insertion order, the final tie-break when two jobs share a priority
    /// and creation time.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

impl State {
    fn insert(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(job.id, Entry { seq, job });
    }

    fn job_mut(&mut self, id: &JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(id)
            .map(|entry| &mut entry.job)
            .ok_or(StoreError::NotFound(*id))
    }
}

/// In-memory job store
///
/// Jobs live in a `HashMap` behind a single mutex. Every operation, the
/// claim included, runs entirely under that lock, which is what makes
/// [`JobStore::dequeue`] atomic here.
///
/// # Capacity Management
/// The store can be given a maximum number of jobs. Once it is reached,
/// `enqueue` fails with [`StoreError::CapacityExceeded`] until retention
/// cleanup frees space.
///
/// # Performance
/// - Enqueue, get, transitions: O(1)
/// - Dequeue, stats, cleanup: O(n) scans
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    state: Arc<Mutex<State>>,
    /// Maximum number of jobs to hold (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryJobStore {
    /// Create an empty store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that holds at most `capacity` jobs
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Insert a job exactly as given, bypassing defaults.
    ///
    /// Used to restore a snapshot, or to seed jobs with historical
    /// timestamps.
    pub fn insert(&self, job: Job) {
        self.state.lock().insert(job);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let job = Job::from_new(job, Utc::now());
        let id = job.id;

        let mut state = self.state.lock();
        if let Some(cap) = self.capacity
            && state.jobs.len() >= cap
        {
            return Err(StoreError::CapacityExceeded(cap));
        }
        state.insert(job);

        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let best = state
            .jobs
            .values_mut()
            .filter(|entry| entry.job.is_claimable_at(now))
            .min_by_key(|entry| (entry.job.priority, entry.job.created_at, entry.seq));

        Ok(best.map(|entry| {
            entry.job.claim();
            entry.job.clone()
        }))
    }

    async fn mark_complete(
        &self,
        id: &JobId,
        provider: &str,
        provider_message_id: &str,
    ) -> Result<()> {
        self.state
            .lock()
            .job_mut(id)?
            .complete(provider, provider_message_id, Utc::now())
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.state
            .lock()
            .job_mut(id)?
            .fail(message, retry_at, Utc::now())
    }

    async fn retry_later(&self, id: &JobId, message: &str, at: DateTime<Utc>) -> Result<()> {
        self.state.lock().job_mut(id)?.requeue(message, at)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(id).map(|entry| entry.job.clone()))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for entry in state.jobs.values() {
            stats.record(entry.job.status, 1);
        }
        Ok(stats)
    }

    async fn pending_count(&self) -> Result<u64> {
        let state = self.state.lock();
        let pending = state
            .jobs
            .values()
            .filter(|entry| entry.job.status == JobStatus::Pending)
            .count();
        Ok(pending as u64)
    }

    async fn cleanup_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = cutoff(Utc::now(), age);
        let mut state = self.state.lock();

        let before = state.jobs.len();
        state.jobs.retain(|_, entry| {
            let job = &entry.job;
            !(job.status.is_terminal() && job.processed_at.is_some_and(|at| at < cutoff))
        });

        Ok((before - state.jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(subject: &str) -> NewJob {
        NewJob::new("to@example.com", "from@example.com", subject, "<p>hi</p>")
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Calls an unsupported method")]
    async fn test_memory_store_basic_operations() {
        let store = MemoryJobStore::new();

        let id = store.enqueue(new_job("basic")).await.expect("Failed to enqueue");
        let job = store.get(&id).await.expect("Failed to get").expect("Job missing");
        assert_eq!(job.subject, "basic");
        assert_eq!(job.status, JobStatus::Pending);

        let claimed = store.dequeue().await.expect("Failed to dequeue").expect("No job");
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        store
            .mark_complete(&id, "smtp", "<1.abc@example.com>")
            .await
            .expect("Failed to complete");

        let done = store.get(&id).await.expect("Failed to get").expect("Job missing");
        assert_eq!(done.status, JobStatus::Sent);
        assert_eq!(done.provider.as_deref(), Some("smtp"));
        assert_eq!(done.provider_message_id.as_deref(), Some("<1.abc@example.com>"));
        assert!(done.processed_at.is_some());
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Calls an unsupported method")]
    async fn test_memory_store_capacity_limit() {
        let store = MemoryJobStore::with_capacity(2);

        store.enqueue(new_job("1")).await.expect("First enqueue should succeed");
        store.enqueue(new_job("2")).await.expect("Second enqueue should succeed");

        let result = store.enqueue(new_job("3")).await;
        assert!(matches!(result, Err(StoreError::CapacityExceeded(2))));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Calls an unsupported method")]
    async fn test_unique_id_generation() {
        let store = MemoryJobStore::new();

        let mut handles = vec![];
        for i in 0..100 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.enqueue(new_job(&format!("message {i}"))).await
            }));
        }

        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let id = handle.await.expect("Task panicked").expect("Enqueue failed");
            assert!(ids.insert(id), "Found duplicate ID: {id}");
        }
        assert_eq!(store.len(), 100);
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Calls an unsupported method")]
    async fn test_unknown_job_is_not_found() {
        let store = MemoryJobStore::new();
        let id = JobId::generate();

        assert!(store.get(&id).await.expect("get").is_none());
        assert!(matches!(
            store.mark_failed(&id, "boom", None).await,
            Err(StoreError::NotFound(missing)) if missing == id
        ));
    }

    #[test]
    fn test_capacity_methods() {
        assert_eq!(MemoryJobStore::new().capacity(), None);
        assert_eq!(MemoryJobStore::with_capacity(100).capacity(), Some(100));
    }
}
