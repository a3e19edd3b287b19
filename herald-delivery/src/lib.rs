//! Delivery side of the herald engine
//!
//! This crate provides:
//! - A pool of workers that claim jobs from a [`JobStore`](herald_store::JobStore)
//! - Ordered failover across delivery providers
//! - The SMTP provider and its failure classification
//! - Retry policy and retention sweeping
//! - Validation and submission of new jobs

pub mod dispatcher;
pub mod error;
pub mod policy;
pub mod provider;
pub mod service;
pub mod sweeper;
pub mod worker;

pub use dispatcher::{DispatchError, Dispatched, Dispatcher};
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use policy::{RetryDecision, RetryPolicy};
pub use provider::{
    DiscardProvider, Phase, Provider, ProviderConfig, ProviderError, QuotaInfo, SecurityMode,
    SendReceipt, SmtpProvider, SmtpProviderConfig, SmtpTimeouts,
};
pub use service::{DeliveryService, JobStatusView, Receipt, SendRequest, ServiceError};
pub use sweeper::{Sweeper, SweeperConfig};
pub use worker::{WorkerConfig, WorkerPool};
