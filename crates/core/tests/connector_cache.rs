//! Connector cache behavior: single-flight materialization, shared
//! handles, and invalidation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;

use veil_common::config::{DatasetCacheSettings, Secrets};
use veil_common::models::{
    ArchiveEntry, BudgetEntry, ColumnSpec, Cost, DatasetAccess, DatasetInfo, Metadata, User,
};
use veil_common::QueryError;
use veil_core::dataset::ConnectorCache;
use veil_core::store::{AdminStore, CasOutcome, Collections, MemoryStore, VersionedBudget};

/// Store wrapper counting catalog resolutions, i.e. loader invocations.
struct CountingStore {
    inner: MemoryStore,
    loads: AtomicUsize,
}

impl CountingStore {
    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdminStore for CountingStore {
    async fn get_user(&self, user_name: &str) -> Result<Option<User>, QueryError> {
        self.inner.get_user(user_name).await
    }
    async fn list_users(&self) -> Result<Vec<String>, QueryError> {
        self.inner.list_users().await
    }
    async fn upsert_user(&self, user: User) -> Result<(), QueryError> {
        self.inner.upsert_user(user).await
    }
    async fn delete_user(&self, user_name: &str) -> Result<(), QueryError> {
        self.inner.delete_user(user_name).await
    }
    async fn set_may_query(&self, user_name: &str, may_query: bool) -> Result<(), QueryError> {
        self.inner.set_may_query(user_name, may_query).await
    }
    async fn grant_dataset(&self, user_name: &str, entry: BudgetEntry) -> Result<(), QueryError> {
        self.inner.grant_dataset(user_name, entry).await
    }
    async fn revoke_dataset(
        &self,
        user_name: &str,
        dataset_name: &str,
    ) -> Result<(), QueryError> {
        self.inner.revoke_dataset(user_name, dataset_name).await
    }
    async fn set_initial_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
        initial: Cost,
    ) -> Result<(), QueryError> {
        self.inner
            .set_initial_budget(user_name, dataset_name, initial)
            .await
    }
    async fn budget(
        &self,
        user_name: &str,
        dataset_name: &str,
    ) -> Result<VersionedBudget, QueryError> {
        self.inner.budget(user_name, dataset_name).await
    }
    async fn debit_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
        expected_version: u64,
        cost: Cost,
    ) -> Result<CasOutcome, QueryError> {
        self.inner
            .debit_budget(user_name, dataset_name, expected_version, cost)
            .await
    }
    async fn credit_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
        expected_version: u64,
        cost: Cost,
    ) -> Result<CasOutcome, QueryError> {
        self.inner
            .credit_budget(user_name, dataset_name, expected_version, cost)
            .await
    }
    async fn get_dataset(&self, dataset_name: &str) -> Result<Option<DatasetInfo>, QueryError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_dataset(dataset_name).await
    }
    async fn list_datasets(&self) -> Result<Vec<String>, QueryError> {
        self.inner.list_datasets().await
    }
    async fn upsert_dataset(
        &self,
        info: DatasetInfo,
        metadata: Metadata,
    ) -> Result<(), QueryError> {
        self.inner.upsert_dataset(info, metadata).await
    }
    async fn delete_dataset(&self, dataset_name: &str) -> Result<(), QueryError> {
        self.inner.delete_dataset(dataset_name).await
    }
    async fn get_metadata(&self, dataset_name: &str) -> Result<Option<Metadata>, QueryError> {
        self.inner.get_metadata(dataset_name).await
    }
    async fn append_archive(&self, entry: ArchiveEntry) -> Result<(), QueryError> {
        self.inner.append_archive(entry).await
    }
    async fn archives_for(
        &self,
        user_name: &str,
        dataset_name: Option<&str>,
    ) -> Result<Vec<ArchiveEntry>, QueryError> {
        self.inner.archives_for(user_name, dataset_name).await
    }
    async fn load_collections(&self, collections: Collections) -> Result<(), QueryError> {
        self.inner.load_collections(collections).await
    }
    async fn snapshot(&self) -> Result<Collections, QueryError> {
        self.inner.snapshot().await
    }
    async fn drop_all(&self) -> Result<(), QueryError> {
        self.inner.drop_all().await
    }
}

async fn counting_store(csv_path: &std::path::Path) -> Arc<CountingStore> {
    let mut columns = IndexMap::new();
    columns.insert(
        "value".to_string(),
        ColumnSpec::Float {
            lower: 0.0,
            upper: 10.0,
            nullable: false,
        },
    );
    let store = CountingStore {
        inner: MemoryStore::new(),
        loads: AtomicUsize::new(0),
    };
    store
        .inner
        .upsert_dataset(
            DatasetInfo {
                dataset_name: "numbers".into(),
                access: DatasetAccess::Path {
                    path: csv_path.to_string_lossy().into_owned(),
                },
            },
            Metadata {
                max_ids: 1,
                rows: 3,
                columns,
            },
        )
        .await
        .unwrap();
    Arc::new(store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn cold_key_loads_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("numbers.csv");
    std::fs::write(&csv_path, "value\n1.0\n2.0\n3.0\n").unwrap();

    let store = counting_store(&csv_path).await;
    let cache = Arc::new(ConnectorCache::new(
        DatasetCacheSettings::default(),
        store.clone(),
        Secrets::default(),
    ));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        handles.push(tokio::spawn(
            async move { cache.acquire("numbers").await },
        ));
    }

    let mut connectors = Vec::new();
    for handle in handles {
        connectors.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(store.loads(), 1);
    for pair in connectors.windows(2) {
        assert!(Arc::ptr_eq(&pair[0], &pair[1]));
    }
    assert_eq!(connectors[0].as_tabular().num_rows(), 3);
}

#[tokio::test]
async fn invalidate_forces_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("numbers.csv");
    std::fs::write(&csv_path, "value\n1.0\n").unwrap();

    let store = counting_store(&csv_path).await;
    let cache = ConnectorCache::new(
        DatasetCacheSettings::default(),
        store.clone(),
        Secrets::default(),
    );

    cache.acquire("numbers").await.unwrap();
    assert_eq!(store.loads(), 1);

    // Warm hits do not reload
    cache.acquire("numbers").await.unwrap();
    assert_eq!(store.loads(), 1);

    std::fs::write(&csv_path, "value\n1.0\n2.0\n").unwrap();
    cache.invalidate("numbers").await;
    let connector = cache.acquire("numbers").await.unwrap();
    assert_eq!(store.loads(), 2);
    assert_eq!(connector.as_tabular().num_rows(), 2);
}

#[tokio::test]
async fn load_failure_does_not_populate_cache() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("missing.csv");

    let store = counting_store(&csv_path).await;
    let cache = ConnectorCache::new(
        DatasetCacheSettings::default(),
        store.clone(),
        Secrets::default(),
    );

    assert!(cache.acquire("numbers").await.is_err());
    assert_eq!(cache.entry_count(), 0);

    // A later acquire retries the load
    std::fs::write(&csv_path, "value\n5.0\n").unwrap();
    let connector = cache.acquire("numbers").await.unwrap();
    assert_eq!(connector.as_tabular().num_rows(), 1);
}

#[tokio::test]
async fn unknown_dataset_is_invalid_query() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("numbers.csv");
    std::fs::write(&csv_path, "value\n1.0\n").unwrap();

    let store = counting_store(&csv_path).await;
    let cache = ConnectorCache::new(
        DatasetCacheSettings::default(),
        store,
        Secrets::default(),
    );

    let err = cache.acquire("absent").await.unwrap_err();
    assert!(matches!(err, QueryError::InvalidQuery { .. }));
}
