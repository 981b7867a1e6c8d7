use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use veil_common::models::{
    ArchiveEntry, BudgetResponse, Cost, CostResponse, Library, Metadata, QueryResponse,
    QueryResult,
};
use veil_common::QueryError;
use veil_core::dataset::dummy::{DEFAULT_DUMMY_ROWS, DEFAULT_DUMMY_SEED};
use veil_core::QueryEngine;

use crate::error::{ApiError, ApiResult};

type Engine = Arc<QueryEngine>;

/// The full route surface: health, metadata, dummy datasets, per-library
/// cost estimation, production and dummy queries, budget reads and the
/// query archive.
pub fn create_router(engine: Engine) -> Router {
    let mut router = Router::new()
        .route("/state", get(state_handler))
        .route("/get_dataset_metadata", get(metadata_handler))
        .route("/get_dummy_dataset", get(dummy_dataset_handler))
        .route("/get_initial_budget", get(initial_budget_handler))
        .route("/get_total_spent_budget", get(spent_budget_handler))
        .route("/get_remaining_budget", get(remaining_budget_handler))
        .route("/get_previous_queries", get(previous_queries_handler));

    for library in Library::ALL {
        router = router
            .route(
                &format!("/estimate_{library}_cost"),
                post(
                    move |state: State<Engine>, headers: HeaderMap, body: Json<serde_json::Value>| {
                        estimate_cost_handler(state, library, headers, body)
                    },
                ),
            )
            .route(
                &format!("/{library}_query"),
                post(
                    move |state: State<Engine>, headers: HeaderMap, body: Json<serde_json::Value>| {
                        query_handler(state, library, headers, body)
                    },
                ),
            )
            .route(
                &format!("/dummy_{library}_query"),
                post(
                    move |state: State<Engine>, headers: HeaderMap, body: Json<serde_json::Value>| {
                        dummy_query_handler(state, library, headers, body)
                    },
                ),
            );
    }

    router.with_state(engine)
}

fn user_from(headers: &HeaderMap) -> Result<String, QueryError> {
    headers
        .get("x-user-name")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| QueryError::unauthorized("missing x-user-name header"))
}

fn dataset_from(body: &serde_json::Value) -> Result<String, QueryError> {
    body.get("dataset_name")
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .ok_or_else(|| QueryError::invalid("request body is missing dataset_name"))
}

/// The client's requested cost, read from the payload fields that carry it.
/// Backends that derive cost from the payload itself (pipelines) have no
/// explicit request; zero is recorded for them.
fn requested_cost(body: &serde_json::Value) -> Cost {
    Cost::new(
        body.get("epsilon").and_then(|v| v.as_f64()).unwrap_or(0.0),
        body.get("delta").and_then(|v| v.as_f64()).unwrap_or(0.0),
    )
}

// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StateResponse {
    status: &'static str,
    message: String,
}

async fn state_handler(State(engine): State<Engine>) -> Json<StateResponse> {
    Json(StateResponse {
        status: "LIVE",
        message: format!("{} queries in flight", engine.in_flight()),
    })
}

#[derive(Debug, Deserialize)]
struct DatasetBody {
    dataset_name: String,
}

async fn metadata_handler(
    State(engine): State<Engine>,
    headers: HeaderMap,
    Json(body): Json<DatasetBody>,
) -> ApiResult<Json<Metadata>> {
    let user = user_from(&headers)?;
    Ok(Json(engine.get_metadata(&user, &body.dataset_name).await?))
}

#[derive(Debug, Deserialize)]
struct DummyDatasetBody {
    dataset_name: String,
    #[serde(default = "default_nb_rows")]
    nb_rows: usize,
    #[serde(default = "default_seed")]
    seed: u64,
}

fn default_nb_rows() -> usize {
    DEFAULT_DUMMY_ROWS
}

fn default_seed() -> u64 {
    DEFAULT_DUMMY_SEED
}

async fn dummy_dataset_handler(
    State(engine): State<Engine>,
    headers: HeaderMap,
    Json(body): Json<DummyDatasetBody>,
) -> ApiResult<Json<QueryResult>> {
    let user = user_from(&headers)?;
    let frame = engine
        .get_dummy_frame(&user, &body.dataset_name, body.nb_rows, body.seed)
        .await?;
    Ok(Json(frame))
}

async fn estimate_cost_handler(
    State(engine): State<Engine>,
    library: Library,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<CostResponse>> {
    let user = user_from(&headers)?;
    let dataset = dataset_from(&body)?;
    let cost = engine.estimate_cost(&user, library, &dataset, &body).await?;
    Ok(Json(CostResponse {
        epsilon: cost.epsilon,
        delta: cost.delta,
    }))
}

async fn query_handler(
    State(engine): State<Engine>,
    library: Library,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<QueryResponse>> {
    let user = user_from(&headers)?;
    let dataset = dataset_from(&body)?;
    let requested = requested_cost(&body);
    let response = engine
        .execute_query(&user, library, &dataset, &body, requested)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct DummyQueryBody {
    #[serde(default = "default_nb_rows")]
    nb_rows: usize,
    #[serde(default = "default_seed")]
    seed: u64,
    #[serde(flatten)]
    payload: serde_json::Value,
}

async fn dummy_query_handler(
    State(engine): State<Engine>,
    library: Library,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<QueryResponse>> {
    let user = user_from(&headers)?;
    let dataset = dataset_from(&body)?;
    let body: DummyQueryBody = serde_json::from_value(body)
        .map_err(|e| ApiError(QueryError::invalid(format!("malformed dummy query: {e}"))))?;
    let response = engine
        .execute_dummy_query(&user, library, &dataset, &body.payload, body.nb_rows, body.seed)
        .await?;
    Ok(Json(response))
}

async fn initial_budget_handler(
    State(engine): State<Engine>,
    headers: HeaderMap,
    Json(body): Json<DatasetBody>,
) -> ApiResult<Json<BudgetResponse>> {
    let user = user_from(&headers)?;
    let summary = engine.get_budget(&user, &body.dataset_name).await?;
    Ok(Json(BudgetResponse {
        epsilon: summary.initial.epsilon,
        delta: summary.initial.delta,
    }))
}

async fn spent_budget_handler(
    State(engine): State<Engine>,
    headers: HeaderMap,
    Json(body): Json<DatasetBody>,
) -> ApiResult<Json<BudgetResponse>> {
    let user = user_from(&headers)?;
    let summary = engine.get_budget(&user, &body.dataset_name).await?;
    Ok(Json(BudgetResponse {
        epsilon: summary.spent.epsilon,
        delta: summary.spent.delta,
    }))
}

async fn remaining_budget_handler(
    State(engine): State<Engine>,
    headers: HeaderMap,
    Json(body): Json<DatasetBody>,
) -> ApiResult<Json<BudgetResponse>> {
    let user = user_from(&headers)?;
    let summary = engine.get_budget(&user, &body.dataset_name).await?;
    Ok(Json(BudgetResponse {
        epsilon: summary.remaining.epsilon,
        delta: summary.remaining.delta,
    }))
}

#[derive(Debug, Deserialize)]
struct PreviousQueriesBody {
    #[serde(default)]
    dataset_name: Option<String>,
}

async fn previous_queries_handler(
    State(engine): State<Engine>,
    headers: HeaderMap,
    Json(body): Json<PreviousQueriesBody>,
) -> ApiResult<Json<Vec<ArchiveEntry>>> {
    let user = user_from(&headers)?;
    Ok(Json(
        engine
            .get_archives(&user, body.dataset_name.as_deref())
            .await?,
    ))
}
