use std::sync::Arc;

use anyhow::Context;
use herald_common::{internal, logging};
use herald_delivery::{
    DeliveryService, DiscardProvider, Dispatcher, Provider, ProviderConfig, SweeperConfig,
    WorkerConfig, WorkerPool,
};
use herald_store::{JobStore, StoreConfig};
use serde::Deserialize;
use tracing::{info, warn};

/// Everything the engine runs, as read from the configuration file.
#[derive(Debug, Default, Deserialize)]
pub struct Herald {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    /// Tried in order for every job.
    #[serde(alias = "provider", default)]
    pub providers: Vec<ProviderConfig>,
    /// Sender for submissions that name none.
    #[serde(default)]
    pub default_from: Option<String>,
}

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            internal!("CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

impl Herald {
    /// Build the configured providers, in order.
    ///
    /// With none configured, every job is accepted by a [`DiscardProvider`].
    ///
    /// # Errors
    ///
    /// Fails if any provider configuration is unusable.
    pub fn providers(&self) -> anyhow::Result<Vec<Arc<dyn Provider>>> {
        if self.providers.is_empty() {
            warn!("No delivery providers configured, messages will be discarded");
            return Ok(vec![Arc::new(DiscardProvider::new())]);
        }

        self.providers
            .iter()
            .enumerate()
            .map(|(index, config)| {
                config
                    .build()
                    .with_context(|| format!("Invalid provider #{index}"))
            })
            .collect()
    }

    /// The submission front end over `store`.
    #[must_use]
    pub fn service(&self, store: Arc<dyn JobStore>) -> DeliveryService {
        let service = DeliveryService::new(store).max_attempts(self.workers.max_retries);
        match &self.default_from {
            Some(from) => service.default_from(from.as_str()),
            None => service,
        }
    }

    /// The worker pool, with the sweeper attached.
    ///
    /// # Errors
    ///
    /// Fails if any provider configuration is unusable.
    pub fn pool(&self, store: Arc<dyn JobStore>) -> anyhow::Result<WorkerPool> {
        let dispatcher = Dispatcher::new(self.providers()?);
        Ok(WorkerPool::new(store, dispatcher, self.workers).with_sweeper(self.sweeper))
    }

    /// Run the engine until SIGINT or SIGTERM
    ///
    /// # Errors
    ///
    /// This function will return an error if the store cannot be opened or a
    /// provider cannot be configured.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        internal!("Controller running");

        let store = self.store.open().await.context("Failed to open job store")?;
        let pool = self.pool(Arc::clone(&store))?;

        let stats = self.service(store).stats().await?;
        info!(
            pending = stats.pending,
            processing = stats.processing,
            sent = stats.sent,
            failed = stats.failed,
            "Job store ready"
        );

        pool.start();
        let ret = shutdown().await;

        internal!("Shutting down...");
        pool.stop().await;

        ret
    }
}
