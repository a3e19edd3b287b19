use async_trait::async_trait;
use herald_store::Job;
use tracing::info;

use super::{Provider, ProviderError, QuotaInfo, SendReceipt};

/// Accepts every message and sends nothing.
///
/// Installed when no transport is configured so the queue still drains
/// during development.
#[derive(Debug, Default)]
pub struct DiscardProvider;

impl DiscardProvider {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for DiscardProvider {
    fn name(&self) -> &'static str {
        "discard"
    }

    async fn send(&self, job: &Job) -> Result<SendReceipt, ProviderError> {
        info!(job_id = %job.id, to = %job.to, subject = %job.subject, "Discarding message");
        Ok(SendReceipt {
            provider_message_id: format!("discard-{}", job.id),
        })
    }

    fn quota(&self) -> QuotaInfo {
        QuotaInfo::unlimited(self.name())
    }
}
