//! End-to-end admission scenarios against an in-memory store and a real
//! worker pool: budget accounting, compensation, dummy isolation, and the
//! in-flight cap.

use std::sync::Arc;

use indexmap::IndexMap;

use veil_common::config::{Config, Secrets, TimeAttack, TimeAttackMethod};
use veil_common::models::{
    ArchiveStatus, BudgetEntry, ColumnSpec, Cost, DatasetAccess, DatasetInfo, Library, Metadata,
    QueryResult, User,
};
use veil_common::QueryError;
use veil_core::queriers::{Querier, QuerierRegistry};
use veil_core::store::{AdminStore, MemoryStore};
use veil_core::QueryEngine;

const USER: &str = "Dr. Antartica";
const DATASET: &str = "PENGUIN";

fn penguin_metadata() -> Metadata {
    let mut columns = IndexMap::new();
    columns.insert(
        "species".to_string(),
        ColumnSpec::String {
            categories: Some(vec!["Adelie".into(), "Chinstrap".into(), "Gentoo".into()]),
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
    Metadata {
        max_ids: 1,
        rows: 300,
        columns,
    }
}

fn penguin_csv() -> String {
    let mut csv = String::from("species,bill_length_mm\n");
    for i in 0..60 {
        let species = ["Adelie", "Chinstrap", "Gentoo"][i % 3];
        let bill = 35.0 + (i % 25) as f64;
        csv.push_str(&format!("{species},{bill}\n"));
    }
    csv
}

struct Harness {
    engine: Arc<QueryEngine>,
    store: Arc<MemoryStore>,
    _dir: tempfile::TempDir,
}

async fn harness(initial: Cost, configure: impl FnOnce(&mut Config)) -> Harness {
    harness_with_registry(initial, configure, None).await
}

async fn harness_with_registry(
    initial: Cost,
    configure: impl FnOnce(&mut Config),
    registry: Option<QuerierRegistry>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("penguin.csv");
    std::fs::write(&csv_path, penguin_csv()).unwrap();

    let store = Arc::new(MemoryStore::new());
    store
        .upsert_dataset(
            DatasetInfo {
                dataset_name: DATASET.into(),
                access: DatasetAccess::Path {
                    path: csv_path.to_string_lossy().into_owned(),
                },
            },
            penguin_metadata(),
        )
        .await
        .unwrap();
    store
        .upsert_user(User {
            user_name: USER.into(),
            may_query: true,
            datasets: vec![BudgetEntry::new(DATASET, initial)],
        })
        .await
        .unwrap();

    let mut config = Config::default();
    config.submit_limit = 8;
    config.server.workers = 2;
    config.broker.queue_depth = 16;
    config.broker.reply_timeout_secs = 10;
    configure(&mut config);

    let engine = match registry {
        Some(registry) => QueryEngine::with_registry(
            &config,
            Secrets::default(),
            store.clone(),
            Arc::new(registry),
        ),
        None => QueryEngine::from_config(&config, Secrets::default(), store.clone()),
    };

    Harness {
        engine,
        store,
        _dir: dir,
    }
}

fn avg_payload(epsilon: f64, delta: f64) -> serde_json::Value {
    serde_json::json!({
        "query_str": "SELECT AVG(bill_length_mm) FROM df",
        "epsilon": epsilon,
        "delta": delta,
    })
}

async fn spent(store: &MemoryStore) -> Cost {
    store.budget(USER, DATASET).await.unwrap().entry.spent()
}

// E1: measured cost is charged and archived.
#[tokio::test]
async fn measured_cost_is_charged_and_archived() {
    let h = harness(Cost::new(10.0, 0.005), |_| {}).await;

    let response = h
        .engine
        .execute_query(
            USER,
            Library::SmartnoiseSql,
            DATASET,
            &avg_payload(0.5, 1e-4),
            Cost::new(0.5, 1e-4),
        )
        .await
        .unwrap();

    assert_eq!(response.requested_by, USER);
    assert!((response.epsilon - 1.0).abs() < 1e-12);
    assert!((response.delta - 5e-5).abs() < 1e-12);

    let summary = h.engine.get_budget(USER, DATASET).await.unwrap();
    assert!((summary.spent.epsilon - 1.0).abs() < 1e-12);
    assert!((summary.spent.delta - 5e-5).abs() < 1e-12);
    assert!((summary.remaining.epsilon - 9.0).abs() < 1e-12);
    assert!((summary.remaining.delta - 0.00495).abs() < 1e-12);

    let archives = h.engine.get_archives(USER, Some(DATASET)).await.unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].status, ArchiveStatus::Ok);
    assert!((archives[0].epsilon - 1.0).abs() < 1e-12);
    assert_eq!(archives[0].payload_hash.len(), 64);
}

// E2: the budget is a hard ceiling.
#[tokio::test]
async fn eleventh_query_exceeds_budget() {
    let h = harness(Cost::new(10.0, 0.005), |_| {}).await;

    for _ in 0..10 {
        h.engine
            .execute_query(
                USER,
                Library::SmartnoiseSql,
                DATASET,
                &avg_payload(0.5, 1e-4),
                Cost::new(0.5, 1e-4),
            )
            .await
            .unwrap();
    }

    let err = h
        .engine
        .execute_query(
            USER,
            Library::SmartnoiseSql,
            DATASET,
            &avg_payload(0.5, 1e-4),
            Cost::new(0.5, 1e-4),
        )
        .await
        .unwrap_err();
    match err {
        QueryError::InvalidQuery { message } => assert!(message.contains("budget exceeded")),
        other => panic!("expected InvalidQuery, got {other:?}"),
    }

    let spent = spent(&h.store).await;
    assert!(!spent.exceeds(&Cost::new(10.0, 0.005)));
    assert!((spent.epsilon - 10.0).abs() < 1e-9);
}

// E3: a transformation-only pipeline is refused with no debit.
#[tokio::test]
async fn transformation_pipeline_costs_nothing() {
    let h = harness(Cost::new(10.0, 0.005), |_| {}).await;
    let payload = serde_json::json!({
        "pipeline": {
            "input_metric": "symmetric_distance",
            "transformations": [
                {"name": "select", "column": "bill_length_mm"},
                {"name": "clamp", "lower": 30.0, "upper": 65.0},
            ],
        }
    });

    let err = h
        .engine
        .execute_query(USER, Library::Opendp, DATASET, &payload, Cost::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::ExternalLib { .. }));

    assert_eq!(spent(&h.store).await, Cost::ZERO);
    assert!(h.engine.get_archives(USER, None).await.unwrap().is_empty());
}

// E4: dummy queries never touch the ledger or the archive.
#[tokio::test]
async fn dummy_queries_are_isolated() {
    let h = harness(Cost::new(10.0, 0.005), |_| {}).await;

    let response = h
        .engine
        .execute_dummy_query(
            USER,
            Library::SmartnoiseSql,
            DATASET,
            &avg_payload(0.5, 1e-4),
            100,
            42,
        )
        .await
        .unwrap();
    assert!(response.result.n_rows() >= 1);

    let frame = h.engine.get_dummy_frame(USER, DATASET, 100, 42).await.unwrap();
    match frame {
        QueryResult::Tabular { columns, rows } => {
            assert_eq!(columns.len(), 2);
            assert_eq!(rows.len(), 100);
        }
        other => panic!("expected tabular frame, got {other:?}"),
    }

    assert_eq!(spent(&h.store).await, Cost::ZERO);
    assert!(h.engine.get_archives(USER, None).await.unwrap().is_empty());
}

// E5 / property 9: stalled responses never return before the floor,
// regardless of outcome.
#[tokio::test]
async fn stall_floor_applies_to_success_and_failure() {
    let h = harness(Cost::new(10.0, 0.005), |config| {
        config.server.time_attack = Some(TimeAttack {
            method: TimeAttackMethod::Stall,
            magnitude: 0.3,
        });
    })
    .await;

    let start = std::time::Instant::now();
    h.engine
        .estimate_cost(USER, Library::SmartnoiseSql, DATASET, &avg_payload(0.5, 1e-4))
        .await
        .unwrap();
    assert!(start.elapsed() >= std::time::Duration::from_millis(300));

    let start = std::time::Instant::now();
    h.engine
        .estimate_cost("nobody", Library::SmartnoiseSql, DATASET, &avg_payload(0.5, 1e-4))
        .await
        .unwrap_err();
    assert!(start.elapsed() >= std::time::Duration::from_millis(300));
}

// Unauthorized and invalid requests never debit.
#[tokio::test]
async fn rejected_admissions_never_debit() {
    let h = harness(Cost::new(10.0, 0.005), |_| {}).await;

    let err = h
        .engine
        .execute_query(
            "nobody",
            Library::SmartnoiseSql,
            DATASET,
            &avg_payload(0.5, 1e-4),
            Cost::new(0.5, 1e-4),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Unauthorized { .. }));

    let err = h
        .engine
        .execute_query(
            USER,
            Library::SmartnoiseSql,
            DATASET,
            &serde_json::json!({"query_str": "DROP TABLE df", "epsilon": 0.5, "delta": 1e-4}),
            Cost::new(0.5, 1e-4),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::InvalidQuery { .. }));

    h.store.set_may_query(USER, false).await.unwrap();
    let err = h
        .engine
        .execute_query(
            USER,
            Library::SmartnoiseSql,
            DATASET,
            &avg_payload(0.5, 1e-4),
            Cost::new(0.5, 1e-4),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Unauthorized { .. }));

    assert_eq!(spent(&h.store).await, Cost::ZERO);
    assert!(h.engine.get_archives(USER, None).await.unwrap().is_empty());
}

// A user whose may_query flag is off can still author against dummies.
#[tokio::test]
async fn dummy_path_ignores_may_query() {
    let h = harness(Cost::new(10.0, 0.005), |_| {}).await;
    h.store.set_may_query(USER, false).await.unwrap();

    h.engine
        .execute_dummy_query(
            USER,
            Library::SmartnoiseSql,
            DATASET,
            &avg_payload(0.5, 1e-4),
            50,
            7,
        )
        .await
        .unwrap();
}

// Backend adapters used for fault injection
// ---------------------------------------------------------------------------

struct FailingQuerier;

impl Querier for FailingQuerier {
    fn library(&self) -> Library {
        Library::SmartnoiseSql
    }
    fn validate(&self, _: &Metadata, _: &serde_json::Value) -> Result<(), QueryError> {
        Ok(())
    }
    fn estimate_cost(&self, _: &Metadata, _: &serde_json::Value) -> Result<Cost, QueryError> {
        Ok(Cost::new(1.0, 5e-5))
    }
    fn execute(
        &self,
        _: &Metadata,
        _: &veil_core::TabularView,
        _: &serde_json::Value,
    ) -> Result<QueryResult, QueryError> {
        Err(QueryError::external(
            Library::SmartnoiseSql,
            "mechanism rejected the release",
        ))
    }
}

struct PanickingQuerier;

impl Querier for PanickingQuerier {
    fn library(&self) -> Library {
        Library::SmartnoiseSql
    }
    fn validate(&self, _: &Metadata, _: &serde_json::Value) -> Result<(), QueryError> {
        Ok(())
    }
    fn estimate_cost(&self, _: &Metadata, _: &serde_json::Value) -> Result<Cost, QueryError> {
        Ok(Cost::new(1.0, 5e-5))
    }
    fn execute(
        &self,
        _: &Metadata,
        _: &veil_core::TabularView,
        _: &serde_json::Value,
    ) -> Result<QueryResult, QueryError> {
        panic!("worker crashed mid-job");
    }
}

// Property 4: compensation restores the exact pre-debit state.
#[tokio::test]
async fn lib_failure_compensates_exactly() {
    let mut registry = QuerierRegistry::new();
    registry.register(Arc::new(FailingQuerier));
    let h = harness_with_registry(Cost::new(10.0, 0.005), |_| {}, Some(registry)).await;

    let err = h
        .engine
        .execute_query(
            USER,
            Library::SmartnoiseSql,
            DATASET,
            &avg_payload(0.5, 1e-4),
            Cost::new(0.5, 1e-4),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::ExternalLib { .. }));

    assert_eq!(spent(&h.store).await, Cost::ZERO);

    let archives = h.engine.get_archives(USER, Some(DATASET)).await.unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].status, ArchiveStatus::Compensated);
}

// E6: a worker crash keeps the debit and leaves an INTERNAL_FAIL row.
#[tokio::test]
async fn worker_crash_keeps_debit() {
    let mut registry = QuerierRegistry::new();
    registry.register(Arc::new(PanickingQuerier));
    let h = harness_with_registry(Cost::new(10.0, 0.005), |_| {}, Some(registry)).await;

    let err = h
        .engine
        .execute_query(
            USER,
            Library::SmartnoiseSql,
            DATASET,
            &avg_payload(0.5, 1e-4),
            Cost::new(0.5, 1e-4),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Internal { .. }));

    let spent = spent(&h.store).await;
    assert!((spent.epsilon - 1.0).abs() < 1e-12);

    let archives = h.engine.get_archives(USER, Some(DATASET)).await.unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].status, ArchiveStatus::InternalFail);
}

// E7 / property 8: concurrent admissions linearize; an exact-fit pair
// drains the budget to zero and a third admission fails.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_exact_fit_admissions() {
    let h = harness(Cost::new(2.0, 1e-4), |_| {}).await;

    let payload_a = avg_payload(0.5, 1e-4);
    let payload_b = avg_payload(0.5, 1e-4);
    let a = h.engine.execute_query(
        USER,
        Library::SmartnoiseSql,
        DATASET,
        &payload_a,
        Cost::new(0.5, 1e-4),
    );
    let b = h.engine.execute_query(
        USER,
        Library::SmartnoiseSql,
        DATASET,
        &payload_b,
        Cost::new(0.5, 1e-4),
    );
    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();

    let summary = h.engine.get_budget(USER, DATASET).await.unwrap();
    assert!(summary.remaining.epsilon.abs() < 1e-9);
    assert!(summary.remaining.delta.abs() < 1e-12);

    let err = h
        .engine
        .execute_query(
            USER,
            Library::SmartnoiseSql,
            DATASET,
            &avg_payload(0.5, 1e-4),
            Cost::new(0.5, 1e-4),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::InvalidQuery { .. }));

    // Archive rows account for exactly the spent budget.
    let archives = h.engine.get_archives(USER, Some(DATASET)).await.unwrap();
    let total: f64 = archives
        .iter()
        .filter(|a| a.status == ArchiveStatus::Ok)
        .map(|a| a.epsilon)
        .sum();
    assert!((total - 2.0).abs() < 1e-9);
}

// The in-flight cap rejects with a retryable signal before any debit.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submit_limit_rejects_with_busy() {
    struct SlowQuerier;
    impl Querier for SlowQuerier {
        fn library(&self) -> Library {
            Library::SmartnoiseSql
        }
        fn validate(&self, _: &Metadata, _: &serde_json::Value) -> Result<(), QueryError> {
            Ok(())
        }
        fn estimate_cost(&self, _: &Metadata, _: &serde_json::Value) -> Result<Cost, QueryError> {
            Ok(Cost::new(0.1, 0.0))
        }
        fn execute(
            &self,
            _: &Metadata,
            _: &veil_core::TabularView,
            _: &serde_json::Value,
        ) -> Result<QueryResult, QueryError> {
            std::thread::sleep(std::time::Duration::from_millis(400));
            Ok(QueryResult::Scalar { value: 0.0 })
        }
    }

    let mut registry = QuerierRegistry::new();
    registry.register(Arc::new(SlowQuerier));
    let h = harness_with_registry(
        Cost::new(10.0, 0.005),
        |config| config.submit_limit = 1,
        Some(registry),
    )
    .await;

    let engine = h.engine.clone();
    let first = tokio::spawn(async move {
        engine
            .execute_query(
                USER,
                Library::SmartnoiseSql,
                DATASET,
                &avg_payload(0.5, 0.0),
                Cost::new(0.5, 0.0),
            )
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let err = h
        .engine
        .execute_query(
            USER,
            Library::SmartnoiseSql,
            DATASET,
            &avg_payload(0.5, 0.0),
            Cost::new(0.5, 0.0),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Busy { .. }));

    first.await.unwrap().unwrap();
    let spent = spent(&h.store).await;
    // Only the admitted query was charged.
    assert!((spent.epsilon - 0.1).abs() < 1e-12);
}
