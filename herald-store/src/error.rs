//! Error types for the job store.

use thiserror::Error;

use crate::{JobId, JobStatus};

/// Top-level job store error type.
///
/// A store error means the requested operation did not take effect: an
/// enqueue that fails has not persisted the job, and a failed transition has
/// left the job as it was.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Job store unavailable: {0}")]
    Unavailable(String),

    /// The backing store was reached but rejected the operation.
    #[error("Job store error: {0}")]
    Backend(String),

    /// No job with the given id exists.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The job is not in a state that permits the requested transition.
    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// A stored record could not be converted to or from a [`Job`](crate::Job).
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The in-memory store is full.
    #[error("Job store capacity exceeded: {0} jobs")]
    CapacityExceeded(usize),
}

/// Specialized `Result` type for job store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;

        match *err.kind {
            ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::DnsResolve { .. } => Self::Unavailable(err.to_string()),
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<mongodb::bson::ser::Error> for StoreError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<mongodb::bson::de::Error> for StoreError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
