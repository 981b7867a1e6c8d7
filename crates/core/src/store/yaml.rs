use std::path::{Path, PathBuf};

use async_trait::async_trait;

use veil_common::models::{ArchiveEntry, BudgetEntry, Cost, DatasetInfo, Metadata, User};
use veil_common::QueryError;

use super::{AdminStore, CasOutcome, Collections, MemoryStore, VersionedBudget};

/// File-backed store: collections are loaded once at startup and every
/// mutation is flushed back with an atomic tmp-rename write.
///
/// Budget versions are process-local; the file only carries the logical
/// collections.
pub struct YamlStore {
    inner: MemoryStore,
    path: PathBuf,
}

impl YamlStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueryError> {
        let path = path.as_ref().to_path_buf();
        let collections = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_yaml::from_str(&content).map_err(|e| {
                QueryError::internal(format!("failed to parse store file {path:?}: {e}"))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Collections::default(),
            Err(e) => {
                return Err(QueryError::internal(format!(
                    "failed to read store file {path:?}: {e}"
                )))
            }
        };
        Ok(Self {
            inner: MemoryStore::from_collections(collections),
            path,
        })
    }

    async fn flush(&self) -> Result<(), QueryError> {
        let collections = self.inner.snapshot().await?;
        let path = self.path.clone();
        let content = serde_yaml::to_string(&collections)
            .map_err(|e| QueryError::internal(format!("failed to serialize store: {e}")))?;

        tokio::task::spawn_blocking(move || {
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, content)
                .map_err(|e| QueryError::internal(format!("failed to write {tmp:?}: {e}")))?;
            // Atomic rename (crash-safe)
            std::fs::rename(&tmp, &path)
                .map_err(|e| QueryError::internal(format!("failed to rename {tmp:?}: {e}")))
        })
        .await
        .map_err(|e| QueryError::internal(format!("store flush task panicked: {e}")))??;
        Ok(())
    }
}

#[async_trait]
impl AdminStore for YamlStore {
    async fn get_user(&self, user_name: &str) -> Result<Option<User>, QueryError> {
        self.inner.get_user(user_name).await
    }

    async fn list_users(&self) -> Result<Vec<String>, QueryError> {
        self.inner.list_users().await
    }

    async fn upsert_user(&self, user: User) -> Result<(), QueryError> {
        self.inner.upsert_user(user).await?;
        self.flush().await
    }

    async fn delete_user(&self, user_name: &str) -> Result<(), QueryError> {
        self.inner.delete_user(user_name).await?;
        self.flush().await
    }

    async fn set_may_query(&self, user_name: &str, may_query: bool) -> Result<(), QueryError> {
        self.inner.set_may_query(user_name, may_query).await?;
        self.flush().await
    }

    async fn grant_dataset(&self, user_name: &str, entry: BudgetEntry) -> Result<(), QueryError> {
        self.inner.grant_dataset(user_name, entry).await?;
        self.flush().await
    }

    async fn revoke_dataset(
        &self,
        user_name: &str,
        dataset_name: &str,
    ) -> Result<(), QueryError> {
        self.inner.revoke_dataset(user_name, dataset_name).await?;
        self.flush().await
    }

    async fn set_initial_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
        initial: Cost,
    ) -> Result<(), QueryError> {
        self.inner
            .set_initial_budget(user_name, dataset_name, initial)
            .await?;
        self.flush().await
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
        let outcome = self
            .inner
            .debit_budget(user_name, dataset_name, expected_version, cost)
            .await?;
        if outcome == CasOutcome::Applied {
            self.flush().await?;
        }
        Ok(outcome)
    }

    async fn credit_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
        expected_version: u64,
        cost: Cost,
    ) -> Result<CasOutcome, QueryError> {
        let outcome = self
            .inner
            .credit_budget(user_name, dataset_name, expected_version, cost)
            .await?;
        if outcome == CasOutcome::Applied {
            self.flush().await?;
        }
        Ok(outcome)
    }

    async fn get_dataset(&self, dataset_name: &str) -> Result<Option<DatasetInfo>, QueryError> {
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
        self.inner.upsert_dataset(info, metadata).await?;
        self.flush().await
    }

    async fn delete_dataset(&self, dataset_name: &str) -> Result<(), QueryError> {
        self.inner.delete_dataset(dataset_name).await?;
        self.flush().await
    }

    async fn get_metadata(&self, dataset_name: &str) -> Result<Option<Metadata>, QueryError> {
        self.inner.get_metadata(dataset_name).await
    }

    async fn append_archive(&self, entry: ArchiveEntry) -> Result<(), QueryError> {
        self.inner.append_archive(entry).await?;
        self.flush().await
    }

    async fn archives_for(
        &self,
        user_name: &str,
        dataset_name: Option<&str>,
    ) -> Result<Vec<ArchiveEntry>, QueryError> {
        self.inner.archives_for(user_name, dataset_name).await
    }

    async fn load_collections(&self, collections: Collections) -> Result<(), QueryError> {
        self.inner.load_collections(collections).await?;
        self.flush().await
    }

    async fn snapshot(&self) -> Result<Collections, QueryError> {
        self.inner.snapshot().await
    }

    async fn drop_all(&self) -> Result<(), QueryError> {
        self.inner.drop_all().await?;
        self.flush().await
    }
}
