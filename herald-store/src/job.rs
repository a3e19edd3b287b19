//! The delivery job and its lifecycle.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Attempts allowed for a job that does not ask for a specific limit.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Shared so ids minted within one millisecond still sort in the order they
/// were handed out.
static GENERATOR: parking_lot::Mutex<ulid::Generator> =
    parking_lot::const_mutex(ulid::Generator::new());

/// Identifier for a job
///
/// A ULID: unique, never reused, and lexicographically sortable by creation
/// time. Ids generated by one process are strictly increasing, which the
/// durable store relies on as the final claim tie-break. It is rendered as
/// the canonical 26 character string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    id: ulid::Ulid,
}

impl JobId {
    /// Create a job ID from a ULID
    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    /// Generate a new unique job ID, greater than any generated before it
    #[must_use]
    pub fn generate() -> Self {
        let id = GENERATOR
            .lock()
            .generate()
            // 2^80 ids in one millisecond; unreachable in practice.
            .unwrap_or_else(|_| ulid::Ulid::new());

        Self { id }
    }

    /// Get the underlying ULID
    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self::new)
    }
}

impl Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Sent and Failed are terminal; only they are subject to retention cleanup.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim priority. Lower ranks are claimed first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// The stored ordinal: 1 for High, 2 for Normal, 3 for Low.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    #[must_use]
    pub const fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            1 => Some(Self::High),
            2 => Some(Self::Normal),
            3 => Some(Self::Low),
            _ => None,
        }
    }
}

impl Serialize for Priority {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.rank())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let rank = i64::deserialize(deserializer)?;
        Self::from_rank(rank).ok_or_else(|| {
            serde::de::Error::custom(format!("priority must be 1, 2 or 3, got {rank}"))
        })
    }
}

/// A job as submitted, before the store assigns its identity and defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl NewJob {
    #[must_use]
    pub fn new(
        to: impl Into<String>,
        from: impl Into<String>,
        subject: impl Into<String>,
        html: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            subject: subject.into(),
            html: html.into(),
            priority: None,
            scheduled_at: None,
            max_attempts: None,
        }
    }

    #[must_use]
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub const fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// One email delivery request together with its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub to: String,
    pub from: String,
    pub subject: String,
    pub html: String,
    pub status: JobStatus,
    pub priority: Priority,
    /// Claims issued for this job. Only a successful claim changes it.
    pub attempts: u32,
    /// Delivery attempts that ended in failure, transient or permanent.
    pub failures: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest instant the job may be claimed.
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
}

impl Job {
    /// Materialise a submitted job, filling in every default.
    #[must_use]
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::generate(),
            to: new.to,
            from: new.from,
            subject: new.subject,
            html: new.html,
            status: JobStatus::Pending,
            priority: new.priority.unwrap_or_default(),
            attempts: 0,
            failures: 0,
            max_attempts: new.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            created_at: now,
            scheduled_at: new.scheduled_at.unwrap_or(now),
            processed_at: None,
            error_message: None,
            provider: None,
            provider_message_id: None,
        }
    }

    /// Whether a claim issued at `now` may select this job.
    #[must_use]
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Failed)
            && self.scheduled_at <= now
            && self.failures < self.max_attempts
    }

    /// Whether another delivery may follow the failure currently being recorded.
    #[must_use]
    pub const fn has_retries_left(&self) -> bool {
        self.failures + 1 < self.max_attempts
    }

    pub(crate) fn claim(&mut self) {
        self.status = JobStatus::Processing;
        self.attempts += 1;
    }

    pub(crate) fn complete(
        &mut self,
        provider: &str,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.expect_processing(JobStatus::Sent)?;
        self.status = JobStatus::Sent;
        self.processed_at = Some(now);
        self.provider = Some(provider.to_string());
        self.provider_message_id = Some(provider_message_id.to_string());
        self.error_message = None;
        Ok(())
    }

    pub(crate) fn fail(
        &mut self,
        message: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.expect_processing(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.processed_at = Some(now);
        self.error_message = Some(message.to_string());
        self.failures += 1;
        if let Some(at) = retry_at {
            self.scheduled_at = at;
        }
        Ok(())
    }

    pub(crate) fn requeue(&mut self, message: &str, at: DateTime<Utc>) -> Result<()> {
        self.expect_processing(JobStatus::Pending)?;
        self.status = JobStatus::Pending;
        self.scheduled_at = at;
        self.error_message = Some(message.to_string());
        self.failures += 1;
        Ok(())
    }

    fn expect_processing(&self, to: JobStatus) -> Result<()> {
        if matches!(self.status, JobStatus::Processing) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            })
        }
    }
}

/// Job counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
}

impl QueueStats {
    pub(crate) const fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Sent => self.sent += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    /// Jobs not yet finished: pending plus processing.
    #[must_use]
    pub const fn queued(&self) -> u64 {
        self.pending + self.processing
    }

    /// Jobs waiting for a worker.
    #[must_use]
    pub const fn queue_size(&self) -> u64 {
        self.pending
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pending + self.processing + self.sent + self.failed
    }
}

/// The instant `age` before `now`, saturating at the earliest representable time.
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(age)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
