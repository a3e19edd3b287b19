pub mod backends;
pub mod config;
pub mod error;
pub mod job;
pub mod r#trait;

pub use backends::{MemoryJobStore, MongoJobStore, TestJobStore};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use job::{DEFAULT_MAX_ATTEMPTS, Job, JobId, JobStatus, NewJob, Priority, QueueStats};
pub use r#trait::JobStore;
