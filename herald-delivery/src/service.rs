//! Submission and lookup of delivery jobs.
//!
//! [`DeliveryService`] is the entry point for callers that want a message
//! sent. It validates requests before anything reaches the store, so the
//! workers only ever see jobs with well-formed addresses and header values.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use herald_common::address::{self, AddressError, envelope_address};
use herald_store::{
    DEFAULT_MAX_ATTEMPTS, Job, JobId, JobStatus, JobStore, NewJob, Priority, QueueStats,
    StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Status reported for a freshly accepted job.
pub const QUEUED: &str = "queued";

/// Optimistic delivery estimate added to the submission time.
fn estimated_delay() -> TimeDelta {
    TimeDelta::minutes(5)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;

/// A request to send one HTML email.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendRequest {
    pub to: String,
    /// Falls back to the service's default sender.
    #[serde(default)]
    pub from: Option<String>,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Do not deliver before this instant.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl SendRequest {
    #[must_use]
    pub fn new(
        to: impl Into<String>,
        subject: impl Into<String>,
        html: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            from: None,
            subject: subject.into(),
            html: html.into(),
            priority: None,
            scheduled_at: None,
        }
    }

    #[must_use]
    pub fn sender(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Acknowledgement of an accepted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub id: JobId,
    pub status: &'static str,
    pub queued_at: DateTime<Utc>,
    pub estimated_delivery: DateTime<Utc>,
}

/// What a caller may see of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub to: String,
    pub subject: String,
    pub priority: Priority,
    pub attempts: u32,
    pub failures: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            to: job.to,
            subject: job.subject,
            priority: job.priority,
            attempts: job.attempts,
            failures: job.failures,
            created_at: job.created_at,
            scheduled_at: job.scheduled_at,
            processed_at: job.processed_at,
            error_message: job.error_message,
            provider: job.provider,
            provider_message_id: job.provider_message_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryService {
    store: Arc<dyn JobStore>,
    default_from: Option<String>,
    max_attempts: u32,
}

impl DeliveryService {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            default_from: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sender used when a request leaves `from` empty.
    #[must_use]
    pub fn default_from(mut self, from: impl Into<String>) -> Self {
        self.default_from = Some(from.into());
        self
    }

    /// Attempt limit stamped on every submitted job.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Validate and enqueue a message.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Validation`] for a missing field or a header value
    /// containing a line break, [`ServiceError::Address`] for a malformed
    /// sender or recipient, and [`ServiceError::Store`] if the enqueue fails.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn submit(&self, request: SendRequest) -> Result<Receipt> {
        required("to", &request.to)?;
        required("subject", &request.subject)?;
        required("html", &request.html)?;

        let from = request
            .from
            .filter(|from| !from.trim().is_empty())
            .or_else(|| self.default_from.clone())
            .ok_or_else(|| ServiceError::Validation("from is required".to_string()))?;

        single_line("to", &request.to)?;
        single_line("from", &from)?;
        single_line("subject", &request.subject)?;

        address::validate(&envelope_address(&request.to))?;
        address::validate(&envelope_address(&from))?;

        let mut job = NewJob::new(request.to, from, request.subject, request.html)
            .priority(request.priority.unwrap_or_default())
            .max_attempts(self.max_attempts);
        if let Some(at) = request.scheduled_at {
            job = job.scheduled_at(at);
        }

        let queued_at = Utc::now();
        let id = self.store.enqueue(job).await?;
        info!(job_id = %id, "Job queued");

        Ok(Receipt {
            id,
            status: QUEUED,
            queued_at,
            estimated_delivery: queued_at + estimated_delay(),
        })
    }

    /// # Errors
    ///
    /// [`ServiceError::NotFound`] for an unknown id.
    pub async fn status(&self, id: &JobId) -> Result<JobStatusView> {
        self.store
            .get(id)
            .await?
            .map(JobStatusView::from)
            .ok_or(ServiceError::NotFound(*id))
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.store.stats().await?)
    }
}

fn required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(ServiceError::Validation(format!("{field} is required")))
    } else {
        Ok(())
    }
}

/// Header values must not smuggle extra header lines.
fn single_line(field: &str, value: &str) -> Result<()> {
    if value.contains(['\r', '\n']) {
        Err(ServiceError::Validation(format!(
            "{field} must not contain line breaks"
        )))
    } else {
        Ok(())
    }
}
