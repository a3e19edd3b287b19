//! Policies applied by the worker pool.
//!
//! - [`RetryPolicy`]: what happens to a job after a failed attempt

pub mod retry;

pub use retry::{RetryDecision, RetryPolicy};
