use std::sync::Arc;

use herald_common::internal;
use serde::Deserialize;

use crate::{MemoryJobStore, MongoJobStore, Result, r#trait::JobStore};

const fn default_max_pool_size() -> u32 {
    10
}

/// Which backend holds the job queue.
#[derive(Debug, Clone, Deserialize)]
pub enum StoreConfig {
    /// Keep jobs in process memory. Nothing survives a restart.
    Memory {
        #[serde(default)]
        capacity: Option<usize>,
    },
    /// Persist jobs in MongoDB.
    Mongo {
        uri: String,
        database: String,
        #[serde(default = "default_max_pool_size")]
        max_pool_size: u32,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory { capacity: None }
    }
}

impl StoreConfig {
    /// Build the configured store and run its initialisation.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be reached or its indexes cannot be
    /// created. Callers treat this as a startup failure.
    pub async fn open(&self) -> Result<Arc<dyn JobStore>> {
        let store: Arc<dyn JobStore> = match self {
            Self::Memory { capacity } => {
                internal!(level = INFO, ?capacity, "Using in-memory job store");
                Arc::new(capacity.map_or_else(MemoryJobStore::new, MemoryJobStore::with_capacity))
            }
            Self::Mongo {
                uri,
                database,
                max_pool_size,
            } => {
                let mut options = mongodb::options::ClientOptions::parse(uri).await?;
                options.max_pool_size = Some(*max_pool_size);
                options.app_name = Some("herald".to_string());

                let client = mongodb::Client::with_options(options)?;
                let database = client.database(database);
                database
                    .run_command(mongodb::bson::doc! { "ping": 1 }, None)
                    .await?;

                internal!(
                    level = INFO,
                    database = %database.name(),
                    "Connected to MongoDB job store"
                );
                Arc::new(MongoJobStore::new(&database))
            }
        };

        store.init().await?;
        Ok(store)
    }
}
