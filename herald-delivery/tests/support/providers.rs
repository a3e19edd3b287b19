//! Providers with scripted outcomes.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use herald_delivery::{
    PermanentError, Phase, Provider, ProviderError, QuotaInfo, SendReceipt, TemporaryError,
};
use herald_store::Job;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    /// A 5xx-style rejection at RCPT.
    Reject,
    /// A 4xx-style deferral at MAIL FROM.
    Defer,
    /// Take this long, then accept.
    Stall(Duration),
}

/// Plays back a list of outcomes, then repeats the fallback.
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str, fallback: Outcome) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then(self, outcomes: &[Outcome]) -> Self {
        self.script.lock().extend(outcomes.iter().copied());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, job: &Job) -> Result<SendReceipt, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().pop_front().unwrap_or(self.fallback);

        match outcome {
            Outcome::Accept => {}
            Outcome::Reject => {
                return Err(ProviderError::new(
                    &self.name,
                    Phase::RcptTo,
                    PermanentError::InvalidRecipient(format!("550 {} unknown", job.to)),
                ));
            }
            Outcome::Defer => {
                return Err(ProviderError::new(
                    &self.name,
                    Phase::MailFrom,
                    TemporaryError::SmtpTemporary("451 try again later".to_string()),
                ));
            }
            Outcome::Stall(delay) => tokio::time::sleep(delay).await,
        }

        Ok(SendReceipt {
            provider_message_id: format!("{}-{}-{call}", self.name, job.id),
        })
    }

    fn quota(&self) -> QuotaInfo {
        QuotaInfo::unlimited(&self.name)
    }
}
