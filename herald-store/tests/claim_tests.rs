//! Claim ordering, exclusivity and retention behaviour of the job store.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use herald_store::{
    Job, JobStatus, JobStore, MemoryJobStore, NewJob, Priority, StoreError, TestJobStore,
};

fn new_job(subject: &str) -> NewJob {
    NewJob::new("to@example.com", "from@example.com", subject, "<p>hi</p>")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeue_hands_out_each_job_once() {
    const JOBS: usize = 5;
    const CALLERS: usize = 16;

    let store = Arc::new(MemoryJobStore::new());
    for i in 0..JOBS {
        store.enqueue(new_job(&format!("job {i}"))).await.expect("enqueue");
    }

    let barrier = Arc::new(tokio::sync::Barrier::new(CALLERS));
    let mut handles = Vec::with_capacity(CALLERS);
    for _ in 0..CALLERS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            store.dequeue().await
        }));
    }

    let mut claimed = HashSet::new();
    let mut empty = 0;
    for handle in handles {
        match handle.await.expect("task panicked").expect("dequeue") {
            Some(job) => assert!(claimed.insert(job.id), "job {} claimed twice", job.id),
            None => empty += 1,
        }
    }

    assert_eq!(claimed.len(), JOBS);
    assert_eq!(empty, CALLERS - JOBS);
}

#[tokio::test]
async fn claims_follow_priority_then_enqueue_order() {
    let store = MemoryJobStore::new();
    let low = store.enqueue(new_job("low").priority(Priority::Low)).await.expect("enqueue");
    let high_a = store.enqueue(new_job("high a").priority(Priority::High)).await.expect("enqueue");
    let normal = store.enqueue(new_job("normal").priority(Priority::Normal)).await.expect("enqueue");
    let high_b = store.enqueue(new_job("high b").priority(Priority::High)).await.expect("enqueue");

    let mut order = Vec::new();
    while let Some(job) = store.dequeue().await.expect("dequeue") {
        order.push(job.id);
    }

    assert_eq!(order, vec![high_a, high_b, normal, low]);
}

#[tokio::test]
async fn equal_priority_is_first_in_first_out() {
    let store = MemoryJobStore::new();
    let first = store.enqueue(new_job("t1")).await.expect("enqueue");
    let second = store.enqueue(new_job("t2")).await.expect("enqueue");

    assert_eq!(store.dequeue().await.expect("dequeue").map(|j| j.id), Some(first));
    assert_eq!(store.dequeue().await.expect("dequeue").map(|j| j.id), Some(second));
}

#[tokio::test]
async fn empty_store_yields_no_job_and_no_error() {
    let store = MemoryJobStore::new();
    assert!(store.dequeue().await.expect("dequeue").is_none());
}

#[tokio::test]
async fn future_jobs_wait_for_their_schedule() {
    let store = MemoryJobStore::new();
    store
        .enqueue(new_job("later").scheduled_at(Utc::now() + TimeDelta::hours(1)))
        .await
        .expect("enqueue");

    assert!(store.dequeue().await.expect("dequeue").is_none());
    assert_eq!(store.pending_count().await.expect("count"), 1);
}

#[tokio::test]
async fn attempts_only_move_on_claim() {
    let store = MemoryJobStore::new();
    let id = store.enqueue(new_job("counted")).await.expect("enqueue");
    assert_eq!(store.get(&id).await.expect("get").expect("job").attempts, 0);

    store.dequeue().await.expect("dequeue").expect("claimed");
    assert_eq!(store.get(&id).await.expect("get").expect("job").attempts, 1);

    store.mark_failed(&id, "rejected", None).await.expect("fail");
    let failed = store.get(&id).await.expect("get").expect("job");
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.failures, 1);

    let _ = store.stats().await.expect("stats");
    let _ = store.pending_count().await.expect("count");
    assert_eq!(store.get(&id).await.expect("get").expect("job").attempts, 1);
}

#[tokio::test]
async fn failed_job_is_claimed_again_once_due() {
    let store = MemoryJobStore::new();
    let id = store.enqueue(new_job("retry me")).await.expect("enqueue");

    store.dequeue().await.expect("dequeue").expect("first claim");
    store
        .mark_failed(&id, "550 mailbox unavailable", None)
        .await
        .expect("fail");

    let failed = store.get(&id).await.expect("get").expect("job");
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.processed_at.is_some());
    assert_eq!(failed.error_message.as_deref(), Some("550 mailbox unavailable"));

    let again = store.dequeue().await.expect("dequeue").expect("second claim");
    assert_eq!(again.id, id);
    assert_eq!(again.status, JobStatus::Processing);
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
async fn failed_job_respects_retry_time() {
    let store = MemoryJobStore::new();
    let id = store.enqueue(new_job("deferred")).await.expect("enqueue");

    store.dequeue().await.expect("dequeue").expect("claim");
    store
        .mark_failed(&id, "rejected", Some(Utc::now() + TimeDelta::minutes(5)))
        .await
        .expect("fail");

    assert!(store.dequeue().await.expect("dequeue").is_none());
}

#[tokio::test]
async fn failure_limit_stops_further_claims() {
    let store = MemoryJobStore::new();
    let id = store.enqueue(new_job("doomed").max_attempts(2)).await.expect("enqueue");

    for _ in 0..2 {
        store.dequeue().await.expect("dequeue").expect("claim");
        store.mark_failed(&id, "rejected", None).await.expect("fail");
    }

    assert!(store.dequeue().await.expect("dequeue").is_none());
    assert_eq!(store.get(&id).await.expect("get").expect("job").failures, 2);
}

#[tokio::test]
async fn retry_later_returns_job_to_pending_with_new_schedule() {
    let store = MemoryJobStore::new();
    let id = store.enqueue(new_job("throttled")).await.expect("enqueue");
    store.dequeue().await.expect("dequeue").expect("claim");

    let at = Utc::now() + TimeDelta::seconds(30);
    store.retry_later(&id, "421 slow down", at).await.expect("retry");

    let job = store.get(&id).await.expect("get").expect("job");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.scheduled_at, at);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.failures, 1);
    assert!(job.processed_at.is_none());
    assert!(store.dequeue().await.expect("dequeue").is_none());
}

#[tokio::test]
async fn transitions_require_processing() {
    let store = MemoryJobStore::new();
    let id = store.enqueue(new_job("pending")).await.expect("enqueue");

    assert!(matches!(
        store.mark_complete(&id, "smtp", "msg").await,
        Err(StoreError::InvalidTransition { from: JobStatus::Pending, to: JobStatus::Sent, .. })
    ));
    assert!(matches!(
        store.mark_failed(&id, "nope", None).await,
        Err(StoreError::InvalidTransition { from: JobStatus::Pending, to: JobStatus::Failed, .. })
    ));
    assert_eq!(
        store.get(&id).await.expect("get").expect("job").status,
        JobStatus::Pending
    );

    store.dequeue().await.expect("dequeue").expect("claim");
    store.mark_complete(&id, "smtp", "msg").await.expect("complete");
    assert!(matches!(
        store.mark_failed(&id, "late", None).await,
        Err(StoreError::InvalidTransition { from: JobStatus::Sent, .. })
    ));
}

fn aged(status: JobStatus, processed_hours_ago: Option<i64>, created_hours_ago: i64) -> Job {
    let now = Utc::now();
    let mut job = Job::from_new(new_job("aged"), now - TimeDelta::hours(created_hours_ago));
    job.status = status;
    job.processed_at = processed_hours_ago.map(|h| now - TimeDelta::hours(h));
    job
}

#[tokio::test]
async fn cleanup_only_touches_old_terminal_jobs() {
    let store = MemoryJobStore::new();

    let old_sent = aged(JobStatus::Sent, Some(48), 49);
    let old_failed = aged(JobStatus::Failed, Some(30), 31);
    let recent_sent = aged(JobStatus::Sent, Some(1), 2);
    let ancient_pending = aged(JobStatus::Pending, None, 24 * 30);
    let ancient_processing = aged(JobStatus::Processing, None, 24 * 30);
    // A retried job keeps the processed_at of its last failure.
    let reclaimed = aged(JobStatus::Processing, Some(72), 80);

    let kept = [&recent_sent, &ancient_pending, &ancient_processing, &reclaimed]
        .map(|job| job.id);
    for job in [old_sent, old_failed, recent_sent.clone(), ancient_pending.clone(), ancient_processing.clone(), reclaimed.clone()] {
        store.insert(job);
    }

    let removed = store
        .cleanup_older_than(Duration::from_secs(24 * 60 * 60))
        .await
        .expect("cleanup");

    assert_eq!(removed, 2);
    assert_eq!(store.len(), 4);
    for id in kept {
        assert!(store.get(&id).await.expect("get").is_some(), "{id} was removed");
    }
}

#[tokio::test]
async fn stats_group_by_status() {
    let store = MemoryJobStore::new();
    let a = store.enqueue(new_job("a")).await.expect("enqueue");
    let b = store.enqueue(new_job("b")).await.expect("enqueue");
    store.enqueue(new_job("c")).await.expect("enqueue");
    store.enqueue(new_job("d")).await.expect("enqueue");

    store.dequeue().await.expect("dequeue");
    store.dequeue().await.expect("dequeue");
    store.dequeue().await.expect("dequeue");
    store.mark_complete(&a, "smtp", "1").await.expect("complete");
    store.mark_failed(&b, "bounced", Some(Utc::now() + TimeDelta::hours(1))).await.expect("fail");

    let stats = store.stats().await.expect("stats");
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.queued(), 2);
    assert_eq!(stats.queue_size(), 1);
    assert_eq!(stats.total(), 4);
}

#[tokio::test]
async fn offline_store_reports_unavailable() {
    let store = TestJobStore::new();
    store.set_offline(true);

    assert!(matches!(
        store.enqueue(new_job("lost")).await,
        Err(StoreError::Unavailable(_))
    ));
    assert!(store.inner().is_empty());

    store.set_offline(false);
    let id = store.enqueue(new_job("kept")).await.expect("enqueue");

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .wait_for(&id, Duration::from_secs(5), |job| job.status == JobStatus::Processing)
                .await
        })
    };
    tokio::task::yield_now().await;
    store.dequeue().await.expect("dequeue").expect("claim");

    let seen = waiter.await.expect("task").expect("job reached processing");
    assert_eq!(seen.attempts, 1);
}
