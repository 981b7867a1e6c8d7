//! Synthetic-data backend.
//!
//! The payload declares its privacy cost up front; the synthesizer fits
//! noisy per-column marginals of the sensitive view and samples a synthetic
//! table from them. Only the noisy marginals ever influence the output.

use std::collections::HashMap;

use rand::Rng;
use serde::Deserialize;

use veil_common::models::{ColumnSpec, Cost, Library, Metadata, QueryResult};
use veil_common::QueryError;

use crate::frame::TabularView;

use super::{laplace_noise, parse_payload, Querier};

/// Bins for numeric marginals.
const NUMERIC_BINS: usize = 20;

/// Cap on sampled rows per request.
const MAX_SAMPLES: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthName {
    Aim,
    Mwem,
    Mst,
    Patectgan,
}

impl SynthName {
    /// Graphical-model synthesizers release through Gaussian noise and need
    /// a positive delta.
    fn needs_delta(&self) -> bool {
        matches!(self, SynthName::Aim | SynthName::Mst)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmartnoiseSynthPayload {
    pub synth_name: SynthName,
    pub epsilon: f64,
    #[serde(default)]
    pub delta: f64,
    /// Empty means all columns.
    #[serde(default)]
    pub select_cols: Vec<String>,
    #[serde(default)]
    pub nb_samples: Option<usize>,
    /// Per-column post-conditions, e.g. `{"age": "not_null"}`.
    #[serde(default)]
    pub constraints: HashMap<String, String>,
}

pub struct SmartnoiseSynthQuerier;

impl SmartnoiseSynthQuerier {
    pub fn new() -> Self {
        Self
    }

    fn check(
        &self,
        metadata: &Metadata,
        payload: &SmartnoiseSynthPayload,
    ) -> Result<Vec<String>, QueryError> {
        if payload.epsilon <= 0.0 {
            return Err(QueryError::invalid("epsilon must be positive"));
        }
        if !(0.0..1.0).contains(&payload.delta) {
            return Err(QueryError::invalid("delta must be in [0, 1)"));
        }
        if payload.synth_name.needs_delta() && payload.delta == 0.0 {
            return Err(QueryError::invalid(format!(
                "synthesizer {:?} requires a positive delta",
                payload.synth_name
            )));
        }
        if let Some(n) = payload.nb_samples {
            if n == 0 || n > MAX_SAMPLES {
                return Err(QueryError::invalid(format!(
                    "nb_samples must be in 1..={MAX_SAMPLES}"
                )));
            }
        }

        let columns: Vec<String> = if payload.select_cols.is_empty() {
            metadata.columns.keys().cloned().collect()
        } else {
            payload.select_cols.clone()
        };

        for name in &columns {
            match metadata.columns.get(name) {
                None => return Err(QueryError::invalid(format!("unknown column: {name}"))),
                Some(ColumnSpec::Datetime { .. }) => {
                    return Err(QueryError::invalid(format!(
                        "column {name}: datetime columns are not supported by synthesizers"
                    )))
                }
                Some(_) => {}
            }
        }

        for (name, constraint) in &payload.constraints {
            if !columns.contains(name) {
                return Err(QueryError::invalid(format!(
                    "constraint on unselected column: {name}"
                )));
            }
            if constraint != "not_null" {
                return Err(QueryError::invalid(format!(
                    "unknown constraint: {constraint}"
                )));
            }
        }

        Ok(columns)
    }
}

impl Querier for SmartnoiseSynthQuerier {
    fn library(&self) -> Library {
        Library::SmartnoiseSynth
    }

    fn validate(
        &self,
        metadata: &Metadata,
        payload: &serde_json::Value,
    ) -> Result<(), QueryError> {
        let payload: SmartnoiseSynthPayload = parse_payload(self.library(), payload)?;
        self.check(metadata, &payload).map(|_| ())
    }

    fn estimate_cost(
        &self,
        metadata: &Metadata,
        payload: &serde_json::Value,
    ) -> Result<Cost, QueryError> {
        let payload: SmartnoiseSynthPayload = parse_payload(self.library(), payload)?;
        self.check(metadata, &payload)?;
        // Cost is declared up front by the payload.
        Ok(Cost::new(payload.epsilon, payload.delta))
    }

    fn execute(
        &self,
        metadata: &Metadata,
        view: &TabularView,
        payload: &serde_json::Value,
    ) -> Result<QueryResult, QueryError> {
        let payload: SmartnoiseSynthPayload = parse_payload(self.library(), payload)?;
        let columns = self.check(metadata, &payload)?;

        let nb_samples = payload.nb_samples.unwrap_or_else(|| view.num_rows().max(1));
        let eps_per_column = payload.epsilon / columns.len() as f64;
        let max_ids = metadata.max_ids as f64;

        let mut samplers = Vec::with_capacity(columns.len());
        for name in &columns {
            let spec = metadata
                .columns
                .get(name)
                .ok_or_else(|| QueryError::internal("checked column vanished from metadata"))?;
            samplers.push(fit_marginal(name, spec, view, eps_per_column, max_ids)?);
        }

        let mut rng = rand::thread_rng();
        let mut rows = Vec::with_capacity(nb_samples);
        for _ in 0..nb_samples {
            let mut row = Vec::with_capacity(samplers.len());
            for sampler in &samplers {
                row.push(sampler.draw(&mut rng));
            }
            rows.push(row);
        }

        Ok(QueryResult::Tabular { columns, rows })
    }
}

/// A noisy marginal distribution over one column's domain.
enum Marginal {
    Categorical {
        values: Vec<serde_json::Value>,
        cumulative: Vec<f64>,
    },
    Numeric {
        lower: f64,
        width: f64,
        cumulative: Vec<f64>,
        integral: bool,
    },
}

impl Marginal {
    fn draw(&self, rng: &mut impl Rng) -> serde_json::Value {
        match self {
            Marginal::Categorical { values, cumulative } => {
                let index = pick(cumulative, rng);
                values[index].clone()
            }
            Marginal::Numeric {
                lower,
                width,
                cumulative,
                integral,
            } => {
                let bin = pick(cumulative, rng);
                let low = lower + *width * bin as f64;
                let value = rng.gen_range(low..low + *width);
                if *integral {
                    serde_json::json!(value.round() as i64)
                } else {
                    serde_json::json!(value)
                }
            }
        }
    }
}

fn pick(cumulative: &[f64], rng: &mut impl Rng) -> usize {
    let total = cumulative.last().copied().unwrap_or(1.0);
    let draw: f64 = rng.gen_range(0.0..total);
    cumulative
        .iter()
        .position(|&c| draw < c)
        .unwrap_or(cumulative.len() - 1)
}

fn noisy_histogram(counts: Vec<f64>, epsilon: f64, sensitivity: f64) -> Vec<f64> {
    let mut cumulative = Vec::with_capacity(counts.len());
    let mut running = 0.0;
    for count in counts {
        let noisy = (count + laplace_noise(sensitivity / epsilon)).max(0.0);
        // Keep every cell reachable so empty noisy histograms stay samplable
        running += noisy + 1e-9;
        cumulative.push(running);
    }
    cumulative
}

fn fit_marginal(
    name: &str,
    spec: &ColumnSpec,
    view: &TabularView,
    epsilon: f64,
    sensitivity: f64,
) -> Result<Marginal, QueryError> {
    match spec {
        ColumnSpec::String { categories, .. } => {
            let cats = categories.clone().unwrap_or_else(|| {
                // No declared categories: fall back to the distinct values
                // of the noisy top of the view
                let mut seen: Vec<String> = Vec::new();
                for v in view.string_column(name).unwrap_or_default() {
                    if !seen.contains(&v) {
                        seen.push(v);
                    }
                }
                seen
            });
            if cats.is_empty() {
                return Err(QueryError::external(
                    Library::SmartnoiseSynth,
                    format!("column {name} has no category domain to synthesize from"),
                ));
            }
            let data = view.string_column(name)?;
            let counts = cats
                .iter()
                .map(|c| data.iter().filter(|v| *v == c).count() as f64)
                .collect();
            Ok(Marginal::Categorical {
                values: cats.iter().map(|c| serde_json::json!(c)).collect(),
                cumulative: noisy_histogram(counts, epsilon, sensitivity),
            })
        }
        ColumnSpec::Bool { .. } => {
            let data = view.bool_column(name)?;
            let trues = data.iter().filter(|v| **v).count() as f64;
            let falses = data.len() as f64 - trues;
            Ok(Marginal::Categorical {
                values: vec![serde_json::json!(false), serde_json::json!(true)],
                cumulative: noisy_histogram(vec![falses, trues], epsilon, sensitivity),
            })
        }
        ColumnSpec::Int {
            categories: Some(cats),
            ..
        } => {
            let data = view.float_column(name)?;
            let counts = cats
                .iter()
                .map(|c| data.iter().filter(|v| **v == *c as f64).count() as f64)
                .collect();
            Ok(Marginal::Categorical {
                values: cats.iter().map(|c| serde_json::json!(c)).collect(),
                cumulative: noisy_histogram(counts, epsilon, sensitivity),
            })
        }
        ColumnSpec::Int {
            lower,
            upper,
            categories: None,
            ..
        } => fit_numeric(name, *lower as f64, *upper as f64 + 1.0, true, view, epsilon,
            sensitivity),
        ColumnSpec::Float { lower, upper, .. } => {
            fit_numeric(name, *lower, *upper, false, view, epsilon, sensitivity)
        }
        ColumnSpec::Datetime { .. } => Err(QueryError::invalid(format!(
            "column {name}: datetime columns are not supported by synthesizers"
        ))),
    }
}

fn fit_numeric(
    name: &str,
    lower: f64,
    upper: f64,
    integral: bool,
    view: &TabularView,
    epsilon: f64,
    sensitivity: f64,
) -> Result<Marginal, QueryError> {
    let span = (upper - lower).max(f64::MIN_POSITIVE);
    let width = span / NUMERIC_BINS as f64;
    let data = view.float_column(name)?;
    let mut counts = vec![0.0; NUMERIC_BINS];
    for v in data {
        let bin = (((v - lower) / width) as usize).min(NUMERIC_BINS - 1);
        counts[bin] += 1.0;
    }
    Ok(Marginal::Numeric {
        lower,
        width,
        cumulative: noisy_histogram(counts, epsilon, sensitivity),
        integral,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn metadata() -> Metadata {
        let mut columns = IndexMap::new();
        columns.insert(
            "species".to_string(),
            ColumnSpec::String {
                categories: Some(vec!["Adelie".into(), "Gentoo".into()]),
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
            rows: 200,
            columns,
        }
    }

    fn payload() -> serde_json::Value {
        serde_json::json!({
            "synth_name": "mwem",
            "epsilon": 2.0,
            "nb_samples": 50,
        })
    }

    #[test]
    fn cost_is_declared_up_front() {
        let querier = SmartnoiseSynthQuerier::new();
        let cost = querier.estimate_cost(&metadata(), &payload()).unwrap();
        assert_eq!(cost.epsilon, 2.0);
        assert_eq!(cost.delta, 0.0);
    }

    #[test]
    fn mst_requires_delta() {
        let querier = SmartnoiseSynthQuerier::new();
        let payload = serde_json::json!({"synth_name": "mst", "epsilon": 1.0});
        assert!(querier.validate(&metadata(), &payload).is_err());
    }

    #[test]
    fn samples_requested_shape_within_domain() {
        let querier = SmartnoiseSynthQuerier::new();
        let meta = metadata();
        let view = crate::dataset::dummy::make_dummy_frame(&meta, 200, 11).unwrap();
        match querier.execute(&meta, &view, &payload()).unwrap() {
            QueryResult::Tabular { columns, rows } => {
                assert_eq!(columns, vec!["species", "bill_length_mm"]);
                assert_eq!(rows.len(), 50);
                for row in rows {
                    let species = row[0].as_str().unwrap();
                    assert!(species == "Adelie" || species == "Gentoo");
                    let bill = row[1].as_f64().unwrap();
                    assert!((30.0..=65.0).contains(&bill));
                }
            }
            other => panic!("expected tabular, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_select_col() {
        let querier = SmartnoiseSynthQuerier::new();
        let payload = serde_json::json!({
            "synth_name": "mwem",
            "epsilon": 1.0,
            "select_cols": ["no_such_column"],
        });
        assert!(querier.validate(&metadata(), &payload).is_err());
    }
}
