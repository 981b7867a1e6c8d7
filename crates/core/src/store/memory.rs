use std::collections::HashMap;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::RwLock;

use veil_common::models::{ArchiveEntry, BudgetEntry, Cost, DatasetInfo, Metadata, User};
use veil_common::QueryError;

use super::{AdminStore, CasOutcome, Collections, VersionedBudget};

#[derive(Default)]
struct State {
    users: IndexMap<String, User>,
    /// (user, dataset) -> budget version; bumped on every budget write.
    versions: HashMap<(String, String), u64>,
    datasets: IndexMap<String, DatasetInfo>,
    metadata: IndexMap<String, Metadata>,
    archives: Vec<ArchiveEntry>,
}

impl State {
    fn budget_entry_mut(
        &mut self,
        user_name: &str,
        dataset_name: &str,
    ) -> Result<&mut BudgetEntry, QueryError> {
        let user = self
            .users
            .get_mut(user_name)
            .ok_or_else(|| QueryError::unauthorized(format!("user {user_name} does not exist")))?;
        user.datasets
            .iter_mut()
            .find(|e| e.dataset_name == dataset_name)
            .ok_or_else(|| {
                QueryError::unauthorized(format!(
                    "{user_name} does not have access to {dataset_name}"
                ))
            })
    }

    fn version(&self, user_name: &str, dataset_name: &str) -> u64 {
        self.versions
            .get(&(user_name.to_string(), dataset_name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn bump_version(&mut self, user_name: &str, dataset_name: &str) {
        *self
            .versions
            .entry((user_name.to_string(), dataset_name.to_string()))
            .or_insert(0) += 1;
    }
}

/// In-process store; the backend for develop mode and tests.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_collections(collections: Collections) -> Self {
        let mut state = State::default();
        apply_collections(&mut state, collections);
        Self {
            state: RwLock::new(state),
        }
    }
}

fn apply_collections(state: &mut State, collections: Collections) {
    state.users = collections
        .users
        .into_iter()
        .map(|u| (u.user_name.clone(), u))
        .collect();
    state.datasets = collections
        .datasets
        .into_iter()
        .map(|d| (d.dataset_name.clone(), d))
        .collect();
    state.metadata = collections.metadata;
    state.archives = collections.queries_archives;
    state.versions.clear();
}

#[async_trait]
impl AdminStore for MemoryStore {
    async fn get_user(&self, user_name: &str) -> Result<Option<User>, QueryError> {
        Ok(self.state.read().await.users.get(user_name).cloned())
    }

    async fn list_users(&self) -> Result<Vec<String>, QueryError> {
        Ok(self.state.read().await.users.keys().cloned().collect())
    }

    async fn upsert_user(&self, user: User) -> Result<(), QueryError> {
        let mut state = self.state.write().await;
        state.users.insert(user.user_name.clone(), user);
        Ok(())
    }

    async fn delete_user(&self, user_name: &str) -> Result<(), QueryError> {
        let mut state = self.state.write().await;
        state
            .users
            .shift_remove(user_name)
            .ok_or_else(|| QueryError::unauthorized(format!("user {user_name} does not exist")))?;
        state.versions.retain(|(u, _), _| u != user_name);
        Ok(())
    }

    async fn set_may_query(&self, user_name: &str, may_query: bool) -> Result<(), QueryError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_name)
            .ok_or_else(|| QueryError::unauthorized(format!("user {user_name} does not exist")))?;
        user.may_query = may_query;
        Ok(())
    }

    async fn grant_dataset(&self, user_name: &str, entry: BudgetEntry) -> Result<(), QueryError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_name)
            .ok_or_else(|| QueryError::unauthorized(format!("user {user_name} does not exist")))?;
        if user
            .datasets
            .iter()
            .any(|e| e.dataset_name == entry.dataset_name)
        {
            return Err(QueryError::invalid(format!(
                "{user_name} already has access to {}",
                entry.dataset_name
            )));
        }
        user.datasets.push(entry);
        Ok(())
    }

    async fn revoke_dataset(
        &self,
        user_name: &str,
        dataset_name: &str,
    ) -> Result<(), QueryError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_name)
            .ok_or_else(|| QueryError::unauthorized(format!("user {user_name} does not exist")))?;
        let before = user.datasets.len();
        user.datasets.retain(|e| e.dataset_name != dataset_name);
        if user.datasets.len() == before {
            return Err(QueryError::unauthorized(format!(
                "{user_name} does not have access to {dataset_name}"
            )));
        }
        state
            .versions
            .remove(&(user_name.to_string(), dataset_name.to_string()));
        Ok(())
    }

    async fn set_initial_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
        initial: Cost,
    ) -> Result<(), QueryError> {
        let mut state = self.state.write().await;
        let entry = state.budget_entry_mut(user_name, dataset_name)?;
        entry.initial_epsilon = initial.epsilon;
        entry.initial_delta = initial.delta;
        state.bump_version(user_name, dataset_name);
        Ok(())
    }

    async fn budget(
        &self,
        user_name: &str,
        dataset_name: &str,
    ) -> Result<VersionedBudget, QueryError> {
        let state = self.state.read().await;
        let user = state
            .users
            .get(user_name)
            .ok_or_else(|| QueryError::unauthorized(format!("user {user_name} does not exist")))?;
        let entry = user.budget_for(dataset_name).ok_or_else(|| {
            QueryError::unauthorized(format!("{user_name} does not have access to {dataset_name}"))
        })?;
        Ok(VersionedBudget {
            entry: entry.clone(),
            version: state.version(user_name, dataset_name),
        })
    }

    async fn debit_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
        expected_version: u64,
        cost: Cost,
    ) -> Result<CasOutcome, QueryError> {
        let mut state = self.state.write().await;
        if state.version(user_name, dataset_name) != expected_version {
            return Ok(CasOutcome::Conflict);
        }
        let entry = state.budget_entry_mut(user_name, dataset_name)?;
        entry.total_spent_epsilon += cost.epsilon;
        entry.total_spent_delta += cost.delta;
        state.bump_version(user_name, dataset_name);
        Ok(CasOutcome::Applied)
    }

    async fn credit_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
        expected_version: u64,
        cost: Cost,
    ) -> Result<CasOutcome, QueryError> {
        let mut state = self.state.write().await;
        if state.version(user_name, dataset_name) != expected_version {
            return Ok(CasOutcome::Conflict);
        }
        let entry = state.budget_entry_mut(user_name, dataset_name)?;
        let restored = entry.spent().saturating_sub(&cost);
        entry.total_spent_epsilon = restored.epsilon;
        entry.total_spent_delta = restored.delta;
        state.bump_version(user_name, dataset_name);
        Ok(CasOutcome::Applied)
    }

    async fn get_dataset(&self, dataset_name: &str) -> Result<Option<DatasetInfo>, QueryError> {
        Ok(self.state.read().await.datasets.get(dataset_name).cloned())
    }

    async fn list_datasets(&self) -> Result<Vec<String>, QueryError> {
        Ok(self.state.read().await.datasets.keys().cloned().collect())
    }

    async fn upsert_dataset(
        &self,
        info: DatasetInfo,
        metadata: Metadata,
    ) -> Result<(), QueryError> {
        metadata.validate()?;
        let mut state = self.state.write().await;
        state
            .metadata
            .insert(info.dataset_name.clone(), metadata);
        state.datasets.insert(info.dataset_name.clone(), info);
        Ok(())
    }

    async fn delete_dataset(&self, dataset_name: &str) -> Result<(), QueryError> {
        let mut state = self.state.write().await;
        state
            .datasets
            .shift_remove(dataset_name)
            .ok_or_else(|| QueryError::invalid(format!("unknown dataset: {dataset_name}")))?;
        state.metadata.shift_remove(dataset_name);
        Ok(())
    }

    async fn get_metadata(&self, dataset_name: &str) -> Result<Option<Metadata>, QueryError> {
        Ok(self.state.read().await.metadata.get(dataset_name).cloned())
    }

    async fn append_archive(&self, entry: ArchiveEntry) -> Result<(), QueryError> {
        self.state.write().await.archives.push(entry);
        Ok(())
    }

    async fn archives_for(
        &self,
        user_name: &str,
        dataset_name: Option<&str>,
    ) -> Result<Vec<ArchiveEntry>, QueryError> {
        let state = self.state.read().await;
        Ok(state
            .archives
            .iter()
            .filter(|a| a.user_name == user_name)
            .filter(|a| dataset_name.map_or(true, |d| a.dataset_name == d))
            .cloned()
            .collect())
    }

    async fn load_collections(&self, collections: Collections) -> Result<(), QueryError> {
        let mut state = self.state.write().await;
        apply_collections(&mut state, collections);
        Ok(())
    }

    async fn snapshot(&self) -> Result<Collections, QueryError> {
        let state = self.state.read().await;
        Ok(Collections {
            users: state.users.values().cloned().collect(),
            datasets: state.datasets.values().cloned().collect(),
            metadata: state.metadata.clone(),
            queries_archives: state.archives.clone(),
        })
    }

    async fn drop_all(&self) -> Result<(), QueryError> {
        let mut state = self.state.write().await;
        *state = State::default();
        Ok(())
    }
}
