//! Transport providers.
//!
//! A [`Provider`] takes one claimed job and either hands it to a remote
//! system or explains, in a classified [`ProviderError`], why it could not.

mod discard;
mod rate;
mod smtp;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::address::{self, AddressError};
use herald_store::Job;
use serde::Deserialize;
use thiserror::Error;

pub use discard::DiscardProvider;
pub use smtp::{SecurityMode, SmtpProvider, SmtpProviderConfig, SmtpTimeouts};

use crate::error::DeliveryError;

/// Where in a send attempt a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Validate,
    Connect,
    Greeting,
    Hello,
    StartTls,
    Auth,
    MailFrom,
    RcptTo,
    Data,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Connect => "connect",
            Self::Greeting => "greeting",
            Self::Hello => "ehlo",
            Self::StartTls => "starttls",
            Self::Auth => "auth",
            Self::MailFrom => "mail_from",
            Self::RcptTo => "rcpt_to",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed send, attributed to a provider and phase.
#[derive(Debug, Error)]
#[error("{provider} failed during {phase}: {error}")]
pub struct ProviderError {
    pub provider: String,
    pub phase: Phase,
    #[source]
    pub error: DeliveryError,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, phase: Phase, error: impl Into<DeliveryError>) -> Self {
        Self {
            provider: provider.into(),
            phase,
            error: error.into(),
        }
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.error.is_temporary()
    }
}

/// Proof of a handed-off message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_message_id: String,
}

/// Usage against a provider's sending ceilings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaInfo {
    pub provider: String,
    pub daily_limit: Option<u32>,
    pub daily_used: u32,
    pub hourly_limit: Option<u32>,
    pub hourly_used: u32,
    /// Sends left before the tighter ceiling is hit; `None` when unlimited.
    pub remaining: Option<u32>,
    /// When the hourly window rolls over.
    pub reset_time: Option<DateTime<Utc>>,
}

impl QuotaInfo {
    /// Quota of a provider without ceilings.
    #[must_use]
    pub fn unlimited(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            daily_limit: None,
            daily_used: 0,
            hourly_limit: None,
            hourly_used: 0,
            remaining: None,
            reset_time: None,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Deliver `job`. A provider never retries internally; the worker owns
    /// the retry decision.
    async fn send(&self, job: &Job) -> Result<SendReceipt, ProviderError>;

    fn quota(&self) -> QuotaInfo;

    /// Structural check applied to the recipient before [`Provider::send`].
    fn validate_address(&self, address: &str) -> Result<(), AddressError> {
        address::validate(address)
    }
}

/// A provider as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub enum ProviderConfig {
    Smtp(SmtpProviderConfig),
    /// Accept and drop every message.
    Discard,
}

impl ProviderConfig {
    /// Build the configured provider.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryError::System`] if the configuration is unusable.
    pub fn build(&self) -> Result<Arc<dyn Provider>, DeliveryError> {
        Ok(match self {
            Self::Smtp(config) => Arc::new(SmtpProvider::new(config.clone())?),
            Self::Discard => Arc::new(DiscardProvider::new()),
        })
    }
}
