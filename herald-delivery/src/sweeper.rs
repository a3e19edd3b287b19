//! Periodic removal of finished jobs.

use std::{sync::Arc, time::Duration};

use herald_common::{Signal, internal};
use herald_store::JobStore;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const fn default_interval() -> u64 {
    3600
}

const fn default_retention() -> u64 {
    86_400
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SweeperConfig {
    /// How often to sweep (in seconds, at least one)
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Sent and Failed jobs processed longer ago than this are deleted (in seconds)
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            retention_secs: default_retention(),
        }
    }
}

impl SweeperConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        // A zero period would make the ticker panic.
        let secs = if self.interval_secs == 0 { 1 } else { self.interval_secs };
        Duration::from_secs(secs)
    }

    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Deletes terminal jobs past their retention on a fixed timer.
#[derive(Debug, Clone)]
pub struct Sweeper {
    store: Arc<dyn JobStore>,
    config: SweeperConfig,
}

impl Sweeper {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    /// Run one sweep, returning how many jobs were deleted.
    ///
    /// # Errors
    ///
    /// Propagates the store failure.
    pub async fn sweep(&self) -> herald_store::Result<u64> {
        let deleted = self
            .store
            .cleanup_older_than(self.config.retention())
            .await?;

        if deleted > 0 {
            info!(deleted, "Removed expired jobs");
        } else {
            debug!("No expired jobs to remove");
        }
        Ok(deleted)
    }

    /// Sweep every interval until a shutdown signal arrives.
    ///
    /// The first sweep happens one full interval after start.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(
            "Sweeper starting: interval={}s retention={}s",
            self.config.interval_secs,
            self.config.retention_secs
        );

        let mut timer = tokio::time::interval(self.config.interval());
        // The first tick completes immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Error removing expired jobs: {e}");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) => internal!("Sweeper received shutdown signal"),
                        Err(e) => error!("Sweeper shutdown channel error: {e}"),
                    }
                    break;
                }
            }
        }

        internal!("Sweeper stopped");
    }
}
