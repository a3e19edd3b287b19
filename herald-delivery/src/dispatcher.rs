//! Ordered failover across providers.

use std::sync::Arc;

use herald_common::address::envelope_address;
use herald_store::Job;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    error::PermanentError,
    provider::{Phase, Provider, ProviderError, QuotaInfo},
};

/// A job handed off successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub provider: String,
    pub provider_message_id: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No delivery providers configured")]
    NoProviders,

    /// Every provider failed. Errors are in the order the providers were tried.
    #[error("All providers failed: {}", summary(.0))]
    Exhausted(Vec<ProviderError>),
}

fn summary(errors: &[ProviderError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DispatchError {
    /// Classified by the last provider tried; no providers counts as permanent.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::NoProviders => false,
            Self::Exhausted(errors) => errors.last().is_some_and(ProviderError::is_temporary),
        }
    }

    /// The failure that decides what happens to the job.
    #[must_use]
    pub fn last(&self) -> Option<&ProviderError> {
        match self {
            Self::NoProviders => None,
            Self::Exhausted(errors) => errors.last(),
        }
    }
}

/// Tries each provider in order until one accepts the job.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    providers: Arc<[Arc<dyn Provider>]>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers: providers.into(),
        }
    }

    #[must_use]
    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    #[must_use]
    pub fn quotas(&self) -> Vec<QuotaInfo> {
        self.providers.iter().map(|provider| provider.quota()).collect()
    }

    /// Send `job` through the first provider that accepts it.
    ///
    /// A provider whose address check rejects the recipient is skipped
    /// without a send attempt.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NoProviders`] when the list is empty, otherwise
    /// [`DispatchError::Exhausted`] with one error per provider.
    #[tracing::instrument(level = "debug", skip_all, fields(job_id = %job.id))]
    pub async fn send(&self, job: &Job) -> Result<Dispatched, DispatchError> {
        if self.providers.is_empty() {
            return Err(DispatchError::NoProviders);
        }

        let recipient = envelope_address(&job.to);
        let mut errors = Vec::with_capacity(self.providers.len());

        for provider in self.providers.iter() {
            let name = provider.name();

            if let Err(error) = provider.validate_address(&recipient) {
                debug!(provider = name, %error, "Provider rejected recipient address");
                errors.push(ProviderError::new(
                    name,
                    Phase::Validate,
                    PermanentError::InvalidAddress(error.to_string()),
                ));
                continue;
            }

            match provider.send(job).await {
                Ok(receipt) => {
                    debug!(provider = name, "Message handed off");
                    return Ok(Dispatched {
                        provider: name.to_string(),
                        provider_message_id: receipt.provider_message_id,
                    });
                }
                Err(error) => {
                    warn!(provider = name, %error, "Provider failed, trying next");
                    errors.push(error);
                }
            }
        }

        Err(DispatchError::Exhausted(errors))
    }
}
