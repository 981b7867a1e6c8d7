//! Classical-DP estimator backend.
//!
//! A payload is a list of estimators, each with its own epsilon; the total
//! cost is declared by the payload (sum of the per-estimator epsilons,
//! delta zero). Estimates are released through the Laplace mechanism with
//! sensitivities derived from the metadata bounds.

use serde::Deserialize;

use veil_common::models::{ColumnSpec, Cost, Library, Metadata, QueryResult};
use veil_common::QueryError;

use crate::frame::TabularView;

use super::{laplace_noise, parse_payload, Querier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    Count,
    Sum,
    Mean,
    Variance,
    Std,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EstimatorSpec {
    pub name: EstimatorKind,
    #[serde(default)]
    pub column: Option<String>,
    pub epsilon: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiffprivlibPayload {
    pub estimators: Vec<EstimatorSpec>,
}

pub struct DiffprivlibQuerier;

impl DiffprivlibQuerier {
    pub fn new() -> Self {
        Self
    }

    fn check(&self, metadata: &Metadata, payload: &DiffprivlibPayload) -> Result<(), QueryError> {
        if payload.estimators.is_empty() {
            return Err(QueryError::invalid("payload declares no estimators"));
        }
        for spec in &payload.estimators {
            if spec.epsilon <= 0.0 {
                return Err(QueryError::invalid("estimator epsilon must be positive"));
            }
            match (spec.name, spec.column.as_deref()) {
                (EstimatorKind::Count, _) => {}
                (_, None) => {
                    return Err(QueryError::invalid(format!(
                        "estimator {:?} requires a column",
                        spec.name
                    )))
                }
                (_, Some(column)) => match metadata.columns.get(column) {
                    Some(ColumnSpec::Int { .. }) | Some(ColumnSpec::Float { .. }) => {}
                    Some(_) => {
                        return Err(QueryError::invalid(format!(
                            "column {column} is not numeric"
                        )))
                    }
                    None => {
                        return Err(QueryError::invalid(format!("unknown column: {column}")))
                    }
                },
            }
        }
        Ok(())
    }
}

impl Querier for DiffprivlibQuerier {
    fn library(&self) -> Library {
        Library::Diffprivlib
    }

    fn validate(
        &self,
        metadata: &Metadata,
        payload: &serde_json::Value,
    ) -> Result<(), QueryError> {
        let payload: DiffprivlibPayload = parse_payload(self.library(), payload)?;
        self.check(metadata, &payload)
    }

    fn estimate_cost(
        &self,
        metadata: &Metadata,
        payload: &serde_json::Value,
    ) -> Result<Cost, QueryError> {
        let payload: DiffprivlibPayload = parse_payload(self.library(), payload)?;
        self.check(metadata, &payload)?;
        let epsilon = payload.estimators.iter().map(|e| e.epsilon).sum();
        Ok(Cost::new(epsilon, 0.0))
    }

    fn execute(
        &self,
        metadata: &Metadata,
        view: &TabularView,
        payload: &serde_json::Value,
    ) -> Result<QueryResult, QueryError> {
        let payload: DiffprivlibPayload = parse_payload(self.library(), payload)?;
        self.check(metadata, &payload)?;

        let max_ids = metadata.max_ids as f64;
        let mut rows = Vec::with_capacity(payload.estimators.len());
        for spec in &payload.estimators {
            let value = release(metadata, view, spec, max_ids)?;
            rows.push(vec![
                serde_json::json!(format!("{:?}", spec.name).to_lowercase()),
                spec.column
                    .as_deref()
                    .map(|c| serde_json::json!(c))
                    .unwrap_or(serde_json::Value::Null),
                serde_json::json!(value),
            ]);
        }

        Ok(QueryResult::Tabular {
            columns: vec!["estimator".into(), "column".into(), "value".into()],
            rows,
        })
    }
}

fn release(
    metadata: &Metadata,
    view: &TabularView,
    spec: &EstimatorSpec,
    max_ids: f64,
) -> Result<f64, QueryError> {
    if spec.name == EstimatorKind::Count {
        let n = view.num_rows() as f64;
        return Ok((n + laplace_noise(max_ids / spec.epsilon)).max(0.0));
    }

    let column = spec
        .column
        .as_deref()
        .ok_or_else(|| QueryError::internal("checked estimator lost its column"))?;
    let (lower, upper) = match metadata.columns.get(column) {
        Some(ColumnSpec::Int { lower, upper, .. }) => (*lower as f64, *upper as f64),
        Some(ColumnSpec::Float { lower, upper, .. }) => (*lower, *upper),
        _ => return Err(QueryError::internal("checked estimator column not numeric")),
    };

    let values: Vec<f64> = view
        .float_column(column)?
        .iter()
        .map(|v| v.clamp(lower, upper))
        .collect();
    let n = values.len().max(1) as f64;
    let span = upper - lower;

    let value = match spec.name {
        EstimatorKind::Sum => {
            let sum: f64 = values.iter().sum();
            let sensitivity = lower.abs().max(upper.abs()) * max_ids;
            sum + laplace_noise(sensitivity / spec.epsilon)
        }
        EstimatorKind::Mean => {
            let mean = values.iter().sum::<f64>() / n;
            let sensitivity = span * max_ids / n;
            mean + laplace_noise(sensitivity / spec.epsilon)
        }
        EstimatorKind::Variance | EstimatorKind::Std => {
            let mean = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let sensitivity = span * span * max_ids / n;
            let noisy = (var + laplace_noise(sensitivity / spec.epsilon)).max(0.0);
            if spec.name == EstimatorKind::Std {
                noisy.sqrt()
            } else {
                noisy
            }
        }
        EstimatorKind::Count => unreachable!("handled above"),
    };
    Ok(value)
}
