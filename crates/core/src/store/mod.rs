//! The administration store: users, per-dataset budgets, the dataset
//! catalog with metadata, and the append-only query archive.
//!
//! Budget fields are only ever mutated through a versioned compare-and-swap;
//! the serial order of successful swaps on one `(user, dataset)` pair is
//! the linearization of accepted queries.

mod memory;
mod yaml;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use veil_common::models::{ArchiveEntry, BudgetEntry, Cost, DatasetInfo, Metadata, User};
use veil_common::QueryError;

pub use memory::MemoryStore;
pub use yaml::YamlStore;

/// A budget entry together with its store version.
///
/// The version changes on every budget write; a debit or credit only
/// applies if the caller still holds the current version.
#[derive(Debug, Clone)]
pub struct VersionedBudget {
    pub entry: BudgetEntry,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    Conflict,
}

/// The logical persisted layout: one document list per collection.
///
/// Serves as the YAML file format of [`YamlStore`] and as the bulk-load
/// format of the administration CLI.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Collections {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub datasets: Vec<DatasetInfo>,
    #[serde(default)]
    pub metadata: IndexMap<String, Metadata>,
    #[serde(default)]
    pub queries_archives: Vec<ArchiveEntry>,
}

#[async_trait]
pub trait AdminStore: Send + Sync {
    // Users and grants
    async fn get_user(&self, user_name: &str) -> Result<Option<User>, QueryError>;
    async fn list_users(&self) -> Result<Vec<String>, QueryError>;
    async fn upsert_user(&self, user: User) -> Result<(), QueryError>;
    async fn delete_user(&self, user_name: &str) -> Result<(), QueryError>;
    async fn set_may_query(&self, user_name: &str, may_query: bool) -> Result<(), QueryError>;
    async fn grant_dataset(&self, user_name: &str, entry: BudgetEntry) -> Result<(), QueryError>;
    async fn revoke_dataset(&self, user_name: &str, dataset_name: &str)
        -> Result<(), QueryError>;
    async fn set_initial_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
        initial: Cost,
    ) -> Result<(), QueryError>;

    // Budget ledger
    /// Current budget state and version for `(user, dataset)`.
    /// Fails with `Unauthorized` if the user or the grant is missing.
    async fn budget(&self, user_name: &str, dataset_name: &str)
        -> Result<VersionedBudget, QueryError>;

    /// `spent <- spent + cost` iff the stored version equals
    /// `expected_version`.
    async fn debit_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
        expected_version: u64,
        cost: Cost,
    ) -> Result<CasOutcome, QueryError>;

    /// `spent <- spent - cost` (clamped at zero) iff the stored version
    /// equals `expected_version`. Used only to compensate a confirmed
    /// backend failure.
    async fn credit_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
        expected_version: u64,
        cost: Cost,
    ) -> Result<CasOutcome, QueryError>;

    // Dataset catalog
    async fn get_dataset(&self, dataset_name: &str) -> Result<Option<DatasetInfo>, QueryError>;
    async fn list_datasets(&self) -> Result<Vec<String>, QueryError>;
    async fn upsert_dataset(
        &self,
        info: DatasetInfo,
        metadata: Metadata,
    ) -> Result<(), QueryError>;
    async fn delete_dataset(&self, dataset_name: &str) -> Result<(), QueryError>;
    async fn get_metadata(&self, dataset_name: &str) -> Result<Option<Metadata>, QueryError>;

    // Query archive (append-only)
    async fn append_archive(&self, entry: ArchiveEntry) -> Result<(), QueryError>;
    async fn archives_for(
        &self,
        user_name: &str,
        dataset_name: Option<&str>,
    ) -> Result<Vec<ArchiveEntry>, QueryError>;

    // Administration
    async fn load_collections(&self, collections: Collections) -> Result<(), QueryError>;
    async fn snapshot(&self) -> Result<Collections, QueryError>;
    async fn drop_all(&self) -> Result<(), QueryError>;
}
