//! SQL aggregate backend.
//!
//! Accepts a restricted aggregate query over the logical table `df`,
//! decomposes it into per-statistic mechanisms, and charges one
//! `(ε, δ/n)` allocation per mechanism. The measured cost therefore grows
//! with the number of mechanisms the query needs: `AVG` decomposes into
//! `SUM` + `COUNT` and costs twice the requested epsilon.

use std::collections::HashMap;

use serde::Deserialize;

use veil_common::models::{ColumnSpec, Cost, Library, Metadata, QueryResult};
use veil_common::QueryError;

use crate::frame::TabularView;

use super::{gaussian_noise, gaussian_sigma, laplace_noise, parse_payload, Querier};

/// Bounded number of re-draws when a composed statistic comes out NaN
/// (noisy denominator at or below zero).
const MAX_NAN_RETRY: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct SmartnoiseSqlPayload {
    pub query_str: String,
    pub epsilon: f64,
    pub delta: f64,
    /// Per-statistic mechanism overrides, e.g. `{"sum_float": "laplace"}`.
    #[serde(default)]
    pub mechanisms: HashMap<String, String>,
    #[serde(default = "default_postprocess")]
    pub postprocess: bool,
}

fn default_postprocess() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggFunc {
    Count,
    Sum,
    Avg,
    Variance,
}

#[derive(Debug, Clone)]
struct Aggregate {
    func: AggFunc,
    column: Option<String>,
    alias: String,
}

/// The statistic slot a mechanism is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Count,
    SumInt,
    SumFloat,
}

impl Slot {
    fn key(&self) -> &'static str {
        match self {
            Slot::Count => "count",
            Slot::SumInt => "sum_int",
            Slot::SumFloat => "sum_float",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mechanism {
    Laplace,
    Geometric,
    Gaussian,
}

impl Mechanism {
    fn parse(s: &str) -> Result<Self, QueryError> {
        match s {
            "laplace" => Ok(Mechanism::Laplace),
            "geometric" => Ok(Mechanism::Geometric),
            "gaussian" => Ok(Mechanism::Gaussian),
            other => Err(QueryError::invalid(format!("unknown mechanism: {other}"))),
        }
    }

    fn needs_delta(&self) -> bool {
        matches!(self, Mechanism::Gaussian)
    }
}

fn default_mechanism(slot: Slot) -> Mechanism {
    match slot {
        Slot::Count | Slot::SumInt => Mechanism::Geometric,
        Slot::SumFloat => Mechanism::Gaussian,
    }
}

/// One elementary noisy statistic the query decomposes into.
#[derive(Debug, Clone)]
struct MechPlan {
    slot: Slot,
    mechanism: Mechanism,
    column: Option<String>,
}

pub struct SmartnoiseSqlQuerier;

impl SmartnoiseSqlQuerier {
    pub fn new() -> Self {
        Self
    }

    fn plan(
        &self,
        metadata: &Metadata,
        payload: &SmartnoiseSqlPayload,
    ) -> Result<(Vec<Aggregate>, Vec<MechPlan>), QueryError> {
        if payload.epsilon <= 0.0 {
            return Err(QueryError::invalid("epsilon must be positive"));
        }
        if !(0.0..1.0).contains(&payload.delta) {
            return Err(QueryError::invalid("delta must be in [0, 1)"));
        }

        let aggregates = parse_query(&payload.query_str)?;
        let mut overrides = HashMap::new();
        for (key, value) in &payload.mechanisms {
            let slot = match key.as_str() {
                "count" => Slot::Count,
                "sum_int" => Slot::SumInt,
                "sum_float" => Slot::SumFloat,
                other => {
                    return Err(QueryError::invalid(format!(
                        "unknown mechanism override target: {other}"
                    )))
                }
            };
            overrides.insert(slot, Mechanism::parse(value)?);
        }

        let mut mechs = Vec::new();
        for agg in &aggregates {
            match agg.func {
                AggFunc::Count => {
                    push_mech(&mut mechs, Slot::Count, None, &overrides);
                }
                AggFunc::Sum => {
                    let column = agg.column.clone();
                    let slot = sum_slot(metadata, column.as_deref())?;
                    push_mech(&mut mechs, slot, column, &overrides);
                }
                AggFunc::Avg => {
                    let column = agg.column.clone();
                    let slot = sum_slot(metadata, column.as_deref())?;
                    push_mech(&mut mechs, slot, column, &overrides);
                    push_mech(&mut mechs, Slot::Count, None, &overrides);
                }
                AggFunc::Variance => {
                    let column = agg.column.clone();
                    let slot = sum_slot(metadata, column.as_deref())?;
                    // sum of squares, sum, count
                    push_mech(&mut mechs, slot, column.clone(), &overrides);
                    push_mech(&mut mechs, slot, column, &overrides);
                    push_mech(&mut mechs, Slot::Count, None, &overrides);
                }
            }
            if let Some(col) = &agg.column {
                if !metadata.columns.contains_key(col) {
                    return Err(QueryError::invalid(format!("unknown column: {col}")));
                }
            }
        }

        if payload.delta == 0.0 && mechs.iter().any(|m| m.mechanism.needs_delta()) {
            return Err(QueryError::invalid(
                "delta must be positive when a gaussian mechanism is assigned",
            ));
        }

        Ok((aggregates, mechs))
    }

    fn measured_cost(&self, payload: &SmartnoiseSqlPayload, mechs: &[MechPlan]) -> Cost {
        let n = mechs.len() as f64;
        let per_mech_delta = payload.delta / n;
        let delta = mechs
            .iter()
            .filter(|m| m.mechanism.needs_delta())
            .count() as f64
            * per_mech_delta;
        Cost::new(payload.epsilon * n, delta)
    }
}

fn push_mech(
    mechs: &mut Vec<MechPlan>,
    slot: Slot,
    column: Option<String>,
    overrides: &HashMap<Slot, Mechanism>,
) {
    let mechanism = overrides
        .get(&slot)
        .copied()
        .unwrap_or_else(|| default_mechanism(slot));
    mechs.push(MechPlan {
        slot,
        mechanism,
        column,
    });
}

fn sum_slot(metadata: &Metadata, column: Option<&str>) -> Result<Slot, QueryError> {
    let column = column.ok_or_else(|| QueryError::invalid("aggregate requires a column"))?;
    match metadata.columns.get(column) {
        Some(ColumnSpec::Int { .. }) => Ok(Slot::SumInt),
        Some(ColumnSpec::Float { .. }) => Ok(Slot::SumFloat),
        Some(_) => Err(QueryError::invalid(format!(
            "column {column} is not numeric"
        ))),
        None => Err(QueryError::invalid(format!("unknown column: {column}"))),
    }
}

impl Querier for SmartnoiseSqlQuerier {
    fn library(&self) -> Library {
        Library::SmartnoiseSql
    }

    fn validate(
        &self,
        metadata: &Metadata,
        payload: &serde_json::Value,
    ) -> Result<(), QueryError> {
        let payload: SmartnoiseSqlPayload = parse_payload(self.library(), payload)?;
        self.plan(metadata, &payload).map(|_| ())
    }

    fn estimate_cost(
        &self,
        metadata: &Metadata,
        payload: &serde_json::Value,
    ) -> Result<Cost, QueryError> {
        let payload: SmartnoiseSqlPayload = parse_payload(self.library(), payload)?;
        let (_, mechs) = self.plan(metadata, &payload)?;
        Ok(self.measured_cost(&payload, mechs.as_slice()))
    }

    fn execute(
        &self,
        metadata: &Metadata,
        view: &TabularView,
        payload: &serde_json::Value,
    ) -> Result<QueryResult, QueryError> {
        let payload: SmartnoiseSqlPayload = parse_payload(self.library(), payload)?;
        let (aggregates, mechs) = self.plan(metadata, &payload)?;
        let per_mech_delta = payload.delta / mechs.len() as f64;

        for _ in 0..=MAX_NAN_RETRY {
            let mut raw = Vec::with_capacity(mechs.len());
            for mech in &mechs {
                raw.push(run_mechanism(
                    metadata,
                    view,
                    mech,
                    payload.epsilon,
                    per_mech_delta,
                )?);
            }

            if !payload.postprocess {
                let columns = (0..raw.len()).map(|i| format!("res_{i}")).collect();
                let row = raw.iter().map(|v| serde_json::json!(v)).collect();
                return Ok(QueryResult::Tabular {
                    columns,
                    rows: vec![row],
                });
            }

            match compose(&aggregates, &raw) {
                Some(values) => {
                    let columns = aggregates.iter().map(|a| a.alias.clone()).collect();
                    let row = values.iter().map(|v| serde_json::json!(v)).collect();
                    return Ok(QueryResult::Tabular {
                        columns,
                        rows: vec![row],
                    });
                }
                // Noisy denominator collapsed; draw again.
                None => continue,
            }
        }

        Err(QueryError::external(
            Library::SmartnoiseSql,
            format!(
                "query produced NaN results; epsilon {} and delta {} are too small to generate output",
                payload.epsilon, payload.delta
            ),
        ))
    }
}

/// Evaluate one elementary mechanism against the view.
fn run_mechanism(
    metadata: &Metadata,
    view: &TabularView,
    mech: &MechPlan,
    epsilon: f64,
    delta: f64,
) -> Result<f64, QueryError> {
    let max_ids = metadata.max_ids as f64;
    let (true_value, sensitivity) = match mech.slot {
        Slot::Count => (view.num_rows() as f64, max_ids),
        Slot::SumInt | Slot::SumFloat => {
            let column = mech
                .column
                .as_deref()
                .ok_or_else(|| QueryError::internal("sum mechanism without a column"))?;
            let (lower, upper) = numeric_bounds(metadata, column)?;
            let values = view.float_column(column)?;
            let sum: f64 = values.iter().map(|v| v.clamp(lower, upper)).sum();
            (sum, lower.abs().max(upper.abs()) * max_ids)
        }
    };

    let noisy = match mech.mechanism {
        Mechanism::Laplace => true_value + laplace_noise(sensitivity / epsilon),
        Mechanism::Geometric => (true_value + laplace_noise(sensitivity / epsilon)).round(),
        Mechanism::Gaussian => {
            true_value + gaussian_noise(gaussian_sigma(sensitivity, epsilon, delta))?
        }
    };
    Ok(noisy)
}

fn numeric_bounds(metadata: &Metadata, column: &str) -> Result<(f64, f64), QueryError> {
    match metadata.columns.get(column) {
        Some(ColumnSpec::Int { lower, upper, .. }) => Ok((*lower as f64, *upper as f64)),
        Some(ColumnSpec::Float { lower, upper, .. }) => Ok((*lower, *upper)),
        _ => Err(QueryError::invalid(format!(
            "column {column} is not numeric"
        ))),
    }
}

/// Post-process raw mechanism outputs back into the requested aggregates.
/// Returns `None` when a composed statistic has a non-positive denominator.
fn compose(aggregates: &[Aggregate], raw: &[f64]) -> Option<Vec<f64>> {
    let mut values = Vec::with_capacity(aggregates.len());
    let mut cursor = 0;
    for agg in aggregates {
        match agg.func {
            AggFunc::Count => {
                values.push(raw[cursor].max(0.0));
                cursor += 1;
            }
            AggFunc::Sum => {
                values.push(raw[cursor]);
                cursor += 1;
            }
            AggFunc::Avg => {
                let (sum, count) = (raw[cursor], raw[cursor + 1]);
                cursor += 2;
                if count <= 0.0 {
                    return None;
                }
                values.push(sum / count);
            }
            AggFunc::Variance => {
                let (sum_sq, sum, count) = (raw[cursor], raw[cursor + 1], raw[cursor + 2]);
                cursor += 3;
                if count <= 0.0 {
                    return None;
                }
                let mean = sum / count;
                values.push((sum_sq / count - mean * mean).max(0.0));
            }
        }
    }
    Some(values)
}

// Query parsing
// ---------------------------------------------------------------------------

/// Parse the restricted grammar
/// `SELECT agg(col) [AS alias] [, ...] FROM df`.
fn parse_query(query: &str) -> Result<Vec<Aggregate>, QueryError> {
    let trimmed = query.trim().trim_end_matches(';');
    let lowered = trimmed.to_ascii_lowercase();
    let rest = lowered
        .strip_prefix("select")
        .ok_or_else(|| QueryError::invalid("query must start with SELECT"))?;

    let from_pos = rest
        .rfind(" from ")
        .ok_or_else(|| QueryError::invalid("query must select FROM df"))?;
    let (select_list, from_clause) = rest.split_at(from_pos);
    let table = from_clause.trim_start_matches(" from ").trim();
    if table != "df" {
        return Err(QueryError::invalid(format!(
            "queries run against the logical table df, not {table}"
        )));
    }

    let mut aggregates = Vec::new();
    for item in select_list.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(QueryError::invalid("empty select item"));
        }
        let (expr, alias) = match item.split_once(" as ") {
            Some((expr, alias)) => (expr.trim(), Some(alias.trim().to_string())),
            None => (item, None),
        };

        let open = expr
            .find('(')
            .ok_or_else(|| QueryError::invalid(format!("only aggregates are allowed: {expr}")))?;
        if !expr.ends_with(')') {
            return Err(QueryError::invalid(format!("malformed aggregate: {expr}")));
        }
        let func_name = expr[..open].trim();
        let arg = expr[open + 1..expr.len() - 1].trim();

        let func = match func_name {
            "count" => AggFunc::Count,
            "sum" => AggFunc::Sum,
            "avg" | "mean" => AggFunc::Avg,
            "var" | "variance" => AggFunc::Variance,
            other => {
                return Err(QueryError::invalid(format!(
                    "unsupported aggregate: {other}"
                )))
            }
        };

        let column = match (func, arg) {
            (AggFunc::Count, "*") => None,
            (_, "*") => return Err(QueryError::invalid("only COUNT may aggregate *")),
            (_, name) if !name.is_empty() => Some(name.to_string()),
            _ => return Err(QueryError::invalid("aggregate requires a column")),
        };

        let alias = alias.unwrap_or_else(|| match &column {
            Some(col) => format!("{func_name}_{col}"),
            None => func_name.to_string(),
        });

        aggregates.push(Aggregate {
            func,
            column,
            alias,
        });
    }

    if aggregates.is_empty() {
        return Err(QueryError::invalid("query selects nothing"));
    }
    Ok(aggregates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn metadata() -> Metadata {
        let mut columns = IndexMap::new();
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
            rows: 300,
            columns,
        }
    }

    fn payload(query: &str, epsilon: f64, delta: f64) -> serde_json::Value {
        serde_json::json!({
            "query_str": query,
            "epsilon": epsilon,
            "delta": delta,
        })
    }

    #[test]
    fn avg_costs_two_mechanisms() {
        let querier = SmartnoiseSqlQuerier::new();
        let cost = querier
            .estimate_cost(
                &metadata(),
                &payload("SELECT AVG(bill_length_mm) FROM df", 0.5, 1e-4),
            )
            .unwrap();
        assert!((cost.epsilon - 1.0).abs() < 1e-12);
        assert!((cost.delta - 5e-5).abs() < 1e-12);
    }

    #[test]
    fn count_costs_exactly_requested_epsilon() {
        let querier = SmartnoiseSqlQuerier::new();
        let cost = querier
            .estimate_cost(&metadata(), &payload("SELECT COUNT(*) FROM df", 0.5, 1e-4))
            .unwrap();
        assert!((cost.epsilon - 0.5).abs() < 1e-12);
        // Geometric count consumes no delta
        assert_eq!(cost.delta, 0.0);
    }

    #[test]
    fn rejects_non_aggregate_select() {
        let querier = SmartnoiseSqlQuerier::new();
        let err = querier
            .validate(
                &metadata(),
                &payload("SELECT bill_length_mm FROM df", 0.5, 1e-4),
            )
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery { .. }));
    }

    #[test]
    fn rejects_wrong_table() {
        let querier = SmartnoiseSqlQuerier::new();
        assert!(querier
            .validate(
                &metadata(),
                &payload("SELECT COUNT(*) FROM penguins", 0.5, 1e-4)
            )
            .is_err());
    }

    #[test]
    fn laplace_override_drops_delta() {
        let querier = SmartnoiseSqlQuerier::new();
        let payload = serde_json::json!({
            "query_str": "SELECT SUM(bill_length_mm) FROM df",
            "epsilon": 0.5,
            "delta": 1e-4,
            "mechanisms": {"sum_float": "laplace"},
        });
        let cost = querier.estimate_cost(&metadata(), &payload).unwrap();
        assert_eq!(cost.delta, 0.0);
    }

    #[test]
    fn executes_count_near_truth() {
        let querier = SmartnoiseSqlQuerier::new();
        let meta = metadata();
        let view = crate::dataset::dummy::make_dummy_frame(&meta, 500, 42).unwrap();
        let result = querier
            .execute(&meta, &view, &payload("SELECT COUNT(*) FROM df", 10.0, 0.0))
            .unwrap();
        match result {
            QueryResult::Tabular { columns, rows } => {
                assert_eq!(columns, vec!["count"]);
                let value = rows[0][0].as_f64().unwrap();
                // epsilon 10 noise on a count of 500 stays well within 50
                assert!((value - 500.0).abs() < 50.0);
            }
            other => panic!("expected tabular, got {other:?}"),
        }
    }

    #[test]
    fn raw_outputs_without_postprocess() {
        let querier = SmartnoiseSqlQuerier::new();
        let meta = metadata();
        let view = crate::dataset::dummy::make_dummy_frame(&meta, 100, 7).unwrap();
        let payload = serde_json::json!({
            "query_str": "SELECT AVG(bill_length_mm) FROM df",
            "epsilon": 1.0,
            "delta": 1e-4,
            "postprocess": false,
        });
        match querier.execute(&meta, &view, &payload).unwrap() {
            QueryResult::Tabular { columns, rows } => {
                assert_eq!(columns, vec!["res_0", "res_1"]);
                assert_eq!(rows.len(), 1);
            }
            other => panic!("expected tabular, got {other:?}"),
        }
    }
}
