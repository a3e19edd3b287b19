//! The pool of workers that claim and deliver jobs.
//!
//! Each worker is an independent loop around [`JobStore::dequeue`]; the
//! atomic claim is the only coordination between them. Workers start
//! staggered so that they do not poll the store in lockstep.
//!
//! ## Shutdown
//!
//! [`WorkerPool::stop`] broadcasts [`Signal::Shutdown`]. The signal cuts any
//! sleep short (poll interval, backoff, stagger) and is checked at the top
//! of every iteration, but a delivery already in flight always runs to
//! completion so its outcome is recorded.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use herald_common::{Signal, internal};
use herald_store::{Job, JobStore, QueueStats};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::{
    sync::broadcast::{self, error::TryRecvError},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    policy::{RetryDecision, RetryPolicy, retry::defaults},
    sweeper::{Sweeper, SweeperConfig},
};

const fn default_count() -> usize {
    2
}

const fn default_poll_interval() -> u64 {
    100
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay() -> u64 {
    defaults::retry_delay().as_secs()
}

const fn default_stagger_base() -> u64 {
    2000
}

const fn default_stagger_step() -> u64 {
    1000
}

const fn default_attempt_timeout() -> u64 {
    300
}

const fn default_error_delay() -> u64 {
    1000
}

const fn default_backoff_step() -> u64 {
    defaults::backoff_step().as_secs()
}

const fn default_backoff_cap() -> u64 {
    defaults::backoff_cap().as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers
    #[serde(default = "default_count")]
    pub count: usize,

    /// Sleep between polls of an empty queue (in milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Attempt limit stamped on jobs submitted through the
    /// [`DeliveryService`](crate::DeliveryService)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait before a permanently failed job is claimable again (in seconds)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Initial delay of worker 0 (in milliseconds)
    #[serde(default = "default_stagger_base")]
    pub stagger_base_ms: u64,

    /// Extra delay for each subsequent worker (in milliseconds)
    #[serde(default = "default_stagger_step")]
    pub stagger_step_ms: u64,

    /// Upper bound on a single dispatch (in seconds)
    ///
    /// An attempt that runs out of time counts as a temporary failure.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Sleep after the store reports an error (in milliseconds)
    #[serde(default = "default_error_delay")]
    pub error_delay_ms: u64,

    /// Backoff added per attempt after a temporary failure (in seconds)
    #[serde(default = "default_backoff_step")]
    pub backoff_step_secs: u64,

    /// Ceiling for the temporary-failure backoff (in seconds)
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            poll_interval_ms: default_poll_interval(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            stagger_base_ms: default_stagger_base(),
            stagger_step_ms: default_stagger_step(),
            attempt_timeout_secs: default_attempt_timeout(),
            error_delay_ms: default_error_delay(),
            backoff_step_secs: default_backoff_step(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `stagger_base + index × stagger_step`
    #[must_use]
    pub fn stagger(&self, index: usize) -> Duration {
        let index = u32::try_from(index).unwrap_or(u32::MAX);
        Duration::from_millis(self.stagger_base_ms)
            .saturating_add(Duration::from_millis(self.stagger_step_ms).saturating_mul(index))
    }

    /// Rest between attempts for worker `index`.
    #[must_use]
    pub fn settle(&self, index: usize) -> Duration {
        self.poll_interval().saturating_add(self.stagger(index))
    }

    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    #[must_use]
    pub const fn error_delay(&self) -> Duration {
        Duration::from_millis(self.error_delay_ms)
    }

    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_step: Duration::from_secs(self.backoff_step_secs),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }
}

/// `now + delay`, saturating at the latest representable instant.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Sleep for `duration` unless a signal arrives first.
///
/// Returns `false` when the sleep was cut short and the caller should stop.
async fn pause(duration: Duration, shutdown: &mut broadcast::Receiver<Signal>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        _ = shutdown.recv() => false,
    }
}

#[derive(Debug)]
struct Worker {
    index: usize,
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    policy: RetryPolicy,
    poll_interval: Duration,
    stagger: Duration,
    settle: Duration,
    attempt_timeout: Duration,
    error_delay: Duration,
}

impl Worker {
    #[tracing::instrument(level = "debug", skip_all, fields(worker = self.index))]
    async fn run(self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!("Worker {} starting after {:?}", self.index, self.stagger);

        if !pause(self.stagger, &mut shutdown).await {
            internal!("Worker {} stopped before its first poll", self.index);
            return;
        }

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(Signal::Shutdown) | Err(_) => break,
            }

            let job = match self.store.dequeue().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if pause(self.poll_interval, &mut shutdown).await {
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    error!(worker = self.index, "Error claiming job: {e}");
                    if pause(self.error_delay, &mut shutdown).await {
                        continue;
                    }
                    break;
                }
            };

            if let Some(backoff) = self.attempt(&job).await
                && !pause(backoff, &mut shutdown).await
            {
                break;
            }

            if !pause(self.settle, &mut shutdown).await {
                break;
            }
        }

        internal!("Worker {} stopped", self.index);
    }

    /// Deliver one claimed job and record the outcome.
    ///
    /// Returns the backoff the worker should observe before its next claim.
    #[tracing::instrument(level = "debug", skip_all, fields(job_id = %job.id, attempt = job.attempts))]
    async fn attempt(&self, job: &Job) -> Option<Duration> {
        debug!(to = %job.to, "Delivering job");

        match tokio::time::timeout(self.attempt_timeout, self.dispatcher.send(job)).await {
            Ok(Ok(dispatched)) => {
                if let Err(e) = self
                    .store
                    .mark_complete(&job.id, &dispatched.provider, &dispatched.provider_message_id)
                    .await
                {
                    error!(job_id = %job.id, "Error recording delivery: {e}");
                } else {
                    info!(
                        job_id = %job.id,
                        provider = %dispatched.provider,
                        provider_message_id = %dispatched.provider_message_id,
                        "Job delivered"
                    );
                }
                None
            }
            Ok(Err(error)) => {
                self.failed(job, &error.to_string(), error.is_temporary())
                    .await
            }
            Err(_) => {
                let message = format!(
                    "Delivery attempt timed out after {}s",
                    self.attempt_timeout.as_secs()
                );
                self.failed(job, &message, true).await
            }
        }
    }

    async fn failed(&self, job: &Job, message: &str, temporary: bool) -> Option<Duration> {
        let now = Utc::now();

        let (result, backoff) = match self.policy.decide(job, temporary) {
            RetryDecision::Backoff(backoff) => {
                warn!(
                    job_id = %job.id,
                    failures = job.failures + 1,
                    backoff_secs = backoff.as_secs(),
                    "Temporary failure, retrying later: {message}"
                );
                (
                    self.store
                        .retry_later(&job.id, message, after(now, backoff))
                        .await,
                    Some(backoff),
                )
            }
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    job_id = %job.id,
                    failures = job.failures + 1,
                    retry_in_secs = delay.as_secs(),
                    "Delivery failed: {message}"
                );
                (
                    self.store
                        .mark_failed(&job.id, message, Some(after(now, delay)))
                        .await,
                    None,
                )
            }
            RetryDecision::GiveUp => {
                error!(
                    job_id = %job.id,
                    failures = job.failures + 1,
                    "Delivery failed, no attempts left: {message}"
                );
                (self.store.mark_failed(&job.id, message, None).await, None)
            }
        };

        if let Err(e) = result {
            error!(job_id = %job.id, "Error recording failure: {e}");
        }
        backoff
    }
}

/// A fixed number of workers plus, optionally, the retention sweeper.
#[derive(Debug)]
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    config: WorkerConfig,
    sweeper: Option<SweeperConfig>,
    shutdown: broadcast::Sender<Signal>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, dispatcher: Dispatcher, config: WorkerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            store,
            dispatcher,
            config,
            sweeper: None,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run a [`Sweeper`] alongside the workers, stopped with them.
    #[must_use]
    pub fn with_sweeper(mut self, config: SweeperConfig) -> Self {
        self.sweeper = Some(config);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Spawn the workers (and sweeper). Calling this on a running pool is a no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!("Worker pool already running");
            return;
        }

        info!(
            workers = self.config.count,
            providers = self.dispatcher.providers().len(),
            "Starting worker pool"
        );

        for index in 0..self.config.count {
            let worker = Worker {
                index,
                store: Arc::clone(&self.store),
                dispatcher: self.dispatcher.clone(),
                policy: self.config.retry_policy(),
                poll_interval: self.config.poll_interval(),
                stagger: self.config.stagger(index),
                settle: self.config.settle(index),
                attempt_timeout: self.config.attempt_timeout(),
                error_delay: self.config.error_delay(),
            };
            handles.push(tokio::spawn(worker.run(self.shutdown.subscribe())));
        }

        if let Some(config) = self.sweeper {
            let sweeper = Sweeper::new(Arc::clone(&self.store), config);
            handles.push(tokio::spawn(sweeper.serve(self.shutdown.subscribe())));
        }
    }

    /// Signal every task to stop and wait for them to finish.
    ///
    /// Deliveries already in flight complete first.
    pub async fn stop(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }

        info!("Stopping worker pool");
        // Every task holds a receiver until it exits, so this only fails
        // when all of them are already gone
        if self.shutdown.send(Signal::Shutdown).is_err() {
            debug!("All workers had already exited");
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {e}");
            }
        }
        info!("Worker pool stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handles.lock().iter().any(|handle| !handle.is_finished())
    }

    /// Queue counts, straight from the store.
    ///
    /// # Errors
    ///
    /// Propagates the store failure.
    pub async fn stats(&self) -> herald_store::Result<QueueStats> {
        self.store.stats().await
    }
}
