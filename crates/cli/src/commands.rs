use anyhow::{bail, Context, Result};

use veil_common::models::{
    BudgetEntry, Cost, DatasetAccess, DatasetInfo, Metadata, User,
};
use veil_core::store::{AdminStore, Collections, YamlStore};

use crate::AdminCommand;

pub async fn run(db_file: &str, command: AdminCommand) -> Result<()> {
    let store = YamlStore::open(db_file)
        .await
        .with_context(|| format!("opening admin store at {db_file}"))?;

    match command {
        AdminCommand::AddUser { name, may_query } => {
            if store.get_user(&name).await?.is_some() {
                bail!("user {name} already exists");
            }
            store
                .upsert_user(User {
                    user_name: name.clone(),
                    may_query,
                    datasets: vec![],
                })
                .await?;
            println!("created user {name}");
        }
        AdminCommand::DelUser { name } => {
            store.delete_user(&name).await?;
            println!("deleted user {name}");
        }
        AdminCommand::SetMayQuery { name, allow } => {
            store.set_may_query(&name, allow).await?;
            println!("user {name}: may_query = {allow}");
        }
        AdminCommand::ShowUser { name } => {
            let user = store
                .get_user(&name)
                .await?
                .with_context(|| format!("user {name} does not exist"))?;
            println!("{}", serde_yaml::to_string(&user)?);
        }
        AdminCommand::ListUsers => {
            for name in store.list_users().await? {
                println!("{name}");
            }
        }
        AdminCommand::AddDatasetToUser {
            user,
            dataset,
            epsilon,
            delta,
        } => {
            store
                .grant_dataset(&user, BudgetEntry::new(&dataset, Cost::new(epsilon, delta)))
                .await?;
            println!("granted {dataset} to {user} with budget ({epsilon}, {delta})");
        }
        AdminCommand::DelDatasetToUser { user, dataset } => {
            store.revoke_dataset(&user, &dataset).await?;
            println!("revoked {dataset} from {user}");
        }
        AdminCommand::SetBudget {
            user,
            dataset,
            epsilon,
            delta,
        } => {
            store
                .set_initial_budget(&user, &dataset, Cost::new(epsilon, delta))
                .await?;
            println!("set initial budget of ({user}, {dataset}) to ({epsilon}, {delta})");
        }
        AdminCommand::AddDataset {
            name,
            path,
            metadata,
        } => {
            let metadata = read_metadata(&metadata)?;
            store
                .upsert_dataset(
                    DatasetInfo {
                        dataset_name: name.clone(),
                        access: DatasetAccess::Path { path },
                    },
                    metadata,
                )
                .await?;
            println!("registered dataset {name}");
        }
        AdminCommand::AddS3Dataset {
            name,
            endpoint_url,
            bucket,
            key,
            credentials_name,
            metadata,
        } => {
            let metadata = read_metadata(&metadata)?;
            store
                .upsert_dataset(
                    DatasetInfo {
                        dataset_name: name.clone(),
                        access: DatasetAccess::S3 {
                            endpoint_url,
                            bucket,
                            key,
                            credentials_name,
                        },
                    },
                    metadata,
                )
                .await?;
            println!("registered dataset {name}");
        }
        AdminCommand::DelDataset { name } => {
            store.delete_dataset(&name).await?;
            println!("deleted dataset {name}");
        }
        AdminCommand::ListDatasets => {
            for name in store.list_datasets().await? {
                println!("{name}");
            }
        }
        AdminCommand::LoadUsers { file } => {
            let collections = read_collections(&file)?;
            if collections.users.is_empty() {
                bail!("{file} holds no users");
            }
            let count = collections.users.len();
            for user in collections.users {
                store.upsert_user(user).await?;
            }
            println!("loaded {count} users from {file}");
        }
        AdminCommand::LoadDatasets { file } => {
            let mut collections = read_collections(&file)?;
            if collections.datasets.is_empty() {
                bail!("{file} holds no datasets");
            }
            let count = collections.datasets.len();
            for info in collections.datasets {
                let metadata = collections
                    .metadata
                    .shift_remove(&info.dataset_name)
                    .with_context(|| {
                        format!("dataset {} has no metadata entry", info.dataset_name)
                    })?;
                store.upsert_dataset(info, metadata).await?;
            }
            println!("loaded {count} datasets from {file}");
        }
        AdminCommand::ShowArchives { user, dataset } => {
            let archives = store.archives_for(&user, dataset.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&archives)?);
        }
        AdminCommand::DropAll { yes } => {
            if !yes {
                bail!("refusing to drop all collections without --yes");
            }
            store.drop_all().await?;
            println!("dropped all collections");
        }
    }

    Ok(())
}

fn read_metadata(path: &str) -> Result<Metadata> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading metadata file {path}"))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing metadata file {path}"))
}

fn read_collections(path: &str) -> Result<Collections> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading collection file {path}"))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing collection file {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grant_and_budget_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("admin.yaml");
        let db = db.to_str().unwrap();

        run(
            db,
            AdminCommand::AddUser {
                name: "alice".into(),
                may_query: true,
            },
        )
        .await
        .unwrap();
        run(
            db,
            AdminCommand::AddDatasetToUser {
                user: "alice".into(),
                dataset: "penguin".into(),
                epsilon: 10.0,
                delta: 0.005,
            },
        )
        .await
        .unwrap();

        let store = YamlStore::open(db).await.unwrap();
        let budget = store.budget("alice", "penguin").await.unwrap();
        assert!((budget.entry.initial_epsilon - 10.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn duplicate_user_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("admin.yaml");
        let db = db.to_str().unwrap();

        run(
            db,
            AdminCommand::AddUser {
                name: "alice".into(),
                may_query: true,
            },
        )
        .await
        .unwrap();
        assert!(run(
            db,
            AdminCommand::AddUser {
                name: "alice".into(),
                may_query: true,
            },
        )
        .await
        .is_err());
    }
}
