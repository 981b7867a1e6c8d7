//! Develop-mode seeding: a demo user and dataset so a fresh instance can
//! serve queries immediately.

use indexmap::IndexMap;

use veil_common::models::{
    BudgetEntry, ColumnSpec, Cost, DatasetAccess, DatasetInfo, Metadata, User,
};
use veil_common::QueryError;
use veil_core::QueryEngine;

pub const DEMO_USER: &str = "Dr. Antartica";
pub const DEMO_DATASET: &str = "PENGUIN";

const DEMO_CSV: &str = "\
species,island,bill_length_mm,flipper_length_mm\n\
Adelie,Torgersen,39.1,181\n\
Adelie,Torgersen,39.5,186\n\
Adelie,Biscoe,40.3,195\n\
Adelie,Dream,36.7,193\n\
Chinstrap,Dream,46.5,192\n\
Chinstrap,Dream,50.0,196\n\
Chinstrap,Dream,51.3,193\n\
Gentoo,Biscoe,46.1,211\n\
Gentoo,Biscoe,50.0,230\n\
Gentoo,Biscoe,48.7,210\n\
Gentoo,Biscoe,47.5,214\n\
Adelie,Biscoe,37.8,174\n\
Adelie,Dream,39.5,178\n\
Chinstrap,Dream,52.7,197\n\
Gentoo,Biscoe,49.9,213\n";

fn demo_metadata() -> Metadata {
    let mut columns = IndexMap::new();
    columns.insert(
        "species".to_string(),
        ColumnSpec::String {
            categories: Some(vec!["Adelie".into(), "Chinstrap".into(), "Gentoo".into()]),
            nullable: false,
        },
    );
    columns.insert(
        "island".to_string(),
        ColumnSpec::String {
            categories: Some(vec!["Torgersen".into(), "Biscoe".into(), "Dream".into()]),
            nullable: false,
        },
    );
    columns.insert(
        "bill_length_mm".to_string(),
        ColumnSpec::Float {
            lower: 30.0,
            upper: 65.0,
            nullable: false,
        },
    );
    columns.insert(
        "flipper_length_mm".to_string(),
        ColumnSpec::Int {
            lower: 150,
            upper: 250,
            categories: None,
            nullable: false,
        },
    );
    Metadata {
        max_ids: 1,
        rows: 15,
        columns,
    }
}

/// Register the demo user and dataset. Idempotent: existing records are
/// overwritten.
pub async fn seed_demo(engine: &QueryEngine) -> Result<(), QueryError> {
    let csv_path = std::env::temp_dir().join("veil_demo_penguin.csv");
    tokio::fs::write(&csv_path, DEMO_CSV)
        .await
        .map_err(|e| QueryError::internal(format!("failed to write demo dataset: {e}")))?;

    let store = engine.store();
    store
        .upsert_dataset(
            DatasetInfo {
                dataset_name: DEMO_DATASET.into(),
                access: DatasetAccess::Path {
                    path: csv_path.to_string_lossy().into_owned(),
                },
            },
            demo_metadata(),
        )
        .await?;
    store
        .upsert_user(User {
            user_name: DEMO_USER.into(),
            may_query: true,
            datasets: vec![BudgetEntry::new(DEMO_DATASET, Cost::new(10.0, 0.005))],
        })
        .await?;

    tracing::info!(user = DEMO_USER, dataset = DEMO_DATASET, "seeded demo data");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use veil_common::config::{Config, Secrets};
    use veil_common::models::Library;
    use veil_core::store::MemoryStore;

    #[tokio::test]
    async fn demo_seed_serves_a_query() {
        let store = Arc::new(MemoryStore::new());
        let engine = QueryEngine::from_config(&Config::default(), Secrets::default(), store);
        seed_demo(&engine).await.unwrap();

        let payload = serde_json::json!({
            "query_str": "SELECT COUNT(*) FROM df",
            "epsilon": 1.0,
            "delta": 0.0,
        });
        let cost = engine
            .estimate_cost(DEMO_USER, Library::SmartnoiseSql, DEMO_DATASET, &payload)
            .await
            .unwrap();
        assert!((cost.epsilon - 1.0).abs() < 1e-12);

        let response = engine
            .execute_query(
                DEMO_USER,
                Library::SmartnoiseSql,
                DEMO_DATASET,
                &payload,
                cost,
            )
            .await
            .unwrap();
        assert_eq!(response.requested_by, DEMO_USER);
    }
}
