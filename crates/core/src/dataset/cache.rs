use std::sync::Arc;

use moka::future::Cache;
use tracing::{debug, info};

use veil_common::config::{DatasetCacheSettings, Secrets};
use veil_common::QueryError;

use crate::store::AdminStore;

use super::{load_connector, Connector};

/// Bounded `dataset_name -> Connector` cache shared by all in-flight
/// queries.
///
/// Materialization is single-flight: concurrent `acquire` calls on a cold
/// key run the loader exactly once and share its outcome. Load failures
/// propagate to every waiter and never populate the cache. Eviction is LRU
/// by capacity; in-flight holders keep their `Arc`, so an evicted connector
/// stays usable until the last handle drops.
pub struct ConnectorCache {
    cache: Cache<String, Arc<dyn Connector>>,
    store: Arc<dyn AdminStore>,
    secrets: Secrets,
}

impl ConnectorCache {
    pub fn new(settings: DatasetCacheSettings, store: Arc<dyn AdminStore>, secrets: Secrets) -> Self {
        let cache = Cache::builder().max_capacity(settings.max_entries).build();
        Self {
            cache,
            store,
            secrets,
        }
    }

    /// Shared read-only handle for a dataset, materializing it on first use.
    pub async fn acquire(&self, dataset_name: &str) -> Result<Arc<dyn Connector>, QueryError> {
        let store = self.store.clone();
        let secrets = self.secrets.clone();
        let name = dataset_name.to_string();

        self.cache
            .try_get_with(name.clone(), async move {
                debug!(dataset = %name, "materializing connector");
                let info = store
                    .get_dataset(&name)
                    .await?
                    .ok_or_else(|| QueryError::invalid(format!("unknown dataset: {name}")))?;
                let metadata = store.get_metadata(&name).await?.ok_or_else(|| {
                    QueryError::internal(format!("dataset {name} has no registered metadata"))
                })?;
                load_connector(&info, metadata, &secrets).await
            })
            .await
            .map_err(|e: Arc<QueryError>| (*e).clone())
    }

    /// Drop a cached connector; the next `acquire` rebuilds it.
    pub async fn invalidate(&self, dataset_name: &str) {
        info!(dataset = %dataset_name, "invalidating cached connector");
        self.cache.invalidate(dataset_name).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
