//! Pipeline backend.
//!
//! Payloads carry a serialized measurement pipeline: a transformation chain
//! over the dataset followed by a noise mechanism. Cost is derived by
//! mapping the dataset distance `d_in = max_ids` through the pipeline's
//! privacy relation. zCDP-shaped pipelines are pre-composed to approximate
//! DP using the caller-supplied `fixed_delta`.

use serde::Deserialize;

use veil_common::config::OpendpFeatures;
use veil_common::models::{ColumnSpec, Cost, Library, Metadata, QueryResult};
use veil_common::QueryError;

use crate::frame::TabularView;

use super::{gaussian_noise, laplace_noise, parse_payload, Querier};

#[derive(Debug, Clone, Deserialize)]
pub struct OpendpPayload {
    pub pipeline: Pipeline,
    #[serde(default)]
    pub fixed_delta: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pipeline {
    pub input_metric: InputMetric,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
    /// Absent for transformation-only pipelines, which the backend refuses.
    #[serde(default)]
    pub measurement: Option<Measurement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMetric {
    SymmetricDistance,
    InsertDeleteDistance,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Transformation {
    Select { column: String },
    Clamp { lower: f64, upper: f64 },
    Sum,
    Count,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Measurement {
    pub mechanism: MechanismKind,
    pub scale: f64,
    /// Defaults to the mechanism's natural measure: pure DP for Laplace,
    /// zero-concentrated divergence for Gaussian.
    #[serde(default)]
    pub output_measure: Option<OutputMeasure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
    Laplace,
    Gaussian,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum OutputMeasure {
    MaxDivergence,
    FixedSmoothedMaxDivergence { delta: f64 },
    SmoothedMaxDivergence,
    ZeroConcentratedDivergence,
}

/// The aggregate the transformation chain ends in.
#[derive(Debug, Clone, Copy, PartialEq)]
enum AggState {
    Count,
    Sum { bound: f64, float: bool },
}

pub struct OpendpQuerier {
    features: OpendpFeatures,
}

impl OpendpQuerier {
    pub fn new(features: OpendpFeatures) -> Self {
        Self { features }
    }

    /// Walk the transformation chain, checking structure and deriving the
    /// aggregate sensitivity state. Structural problems are `InvalidQuery`;
    /// relation problems surface later as `ExternalLib`.
    fn walk(
        &self,
        metadata: &Metadata,
        pipeline: &Pipeline,
    ) -> Result<(Option<String>, Option<(f64, f64)>, Option<AggState>), QueryError> {
        let mut column: Option<String> = None;
        let mut bounds: Option<(f64, f64)> = None;
        let mut agg: Option<AggState> = None;

        for step in &pipeline.transformations {
            if agg.is_some() {
                return Err(QueryError::invalid(
                    "no transformation may follow an aggregation",
                ));
            }
            match step {
                Transformation::Select { column: name } => {
                    if column.is_some() {
                        return Err(QueryError::invalid("pipeline selects twice"));
                    }
                    if !metadata.columns.contains_key(name) {
                        return Err(QueryError::invalid(format!("unknown column: {name}")));
                    }
                    column = Some(name.clone());
                }
                Transformation::Clamp { lower, upper } => {
                    if column.is_none() {
                        return Err(QueryError::invalid("clamp requires a selected column"));
                    }
                    if lower > upper {
                        return Err(QueryError::invalid("clamp bounds are inverted"));
                    }
                    bounds = Some((*lower, *upper));
                }
                Transformation::Sum => {
                    let name = column
                        .as_deref()
                        .ok_or_else(|| QueryError::invalid("sum requires a selected column"))?;
                    let float = match metadata.columns.get(name) {
                        Some(ColumnSpec::Float { .. }) => true,
                        Some(ColumnSpec::Int { .. }) => false,
                        _ => {
                            return Err(QueryError::invalid(format!(
                                "column {name} is not numeric"
                            )))
                        }
                    };
                    let (lower, upper) = bounds.ok_or_else(|| {
                        QueryError::external(
                            Library::Opendp,
                            "sum over an unbounded domain has no privacy map",
                        )
                    })?;
                    agg = Some(AggState::Sum {
                        bound: lower.abs().max(upper.abs()),
                        float,
                    });
                }
                Transformation::Count => {
                    agg = Some(AggState::Count);
                }
            }
        }
        Ok((column, bounds, agg))
    }

    /// The pipeline's (sensitivity, mechanism, measure) triple, after
    /// feature gating.
    fn relation(
        &self,
        metadata: &Metadata,
        payload: &OpendpPayload,
    ) -> Result<(f64, Measurement, OutputMeasure), QueryError> {
        let measurement = payload.pipeline.measurement.clone().ok_or_else(|| {
            QueryError::external(
                Library::Opendp,
                "the pipeline is a transformation, not a measurement; it cannot be executed",
            )
        })?;
        if measurement.scale <= 0.0 {
            return Err(QueryError::invalid("mechanism scale must be positive"));
        }

        let (_, _, agg) = self.walk(metadata, &payload.pipeline)?;
        let d_in = metadata.max_ids as f64;
        let sensitivity = match agg {
            Some(AggState::Count) => d_in,
            Some(AggState::Sum { bound, float }) => {
                if float && !self.features.floating_point {
                    return Err(QueryError::external(
                        Library::Opendp,
                        "floating-point sums require the floating_point feature",
                    ));
                }
                bound * d_in
            }
            None => {
                return Err(QueryError::external(
                    Library::Opendp,
                    "the pipeline does not aggregate; row-level releases are refused",
                ))
            }
        };

        if measurement.mechanism == MechanismKind::Gaussian && !self.features.contrib {
            return Err(QueryError::external(
                Library::Opendp,
                "the gaussian mechanism requires the contrib feature",
            ));
        }

        let measure = measurement.output_measure.unwrap_or(match measurement.mechanism {
            MechanismKind::Laplace => OutputMeasure::MaxDivergence,
            MechanismKind::Gaussian => OutputMeasure::ZeroConcentratedDivergence,
        });

        // Mechanism / measure compatibility
        match (measurement.mechanism, measure) {
            (MechanismKind::Laplace, OutputMeasure::MaxDivergence)
            | (MechanismKind::Gaussian, OutputMeasure::ZeroConcentratedDivergence)
            | (MechanismKind::Gaussian, OutputMeasure::SmoothedMaxDivergence)
            | (MechanismKind::Gaussian, OutputMeasure::FixedSmoothedMaxDivergence { .. }) => {}
            (mechanism, measure) => {
                return Err(QueryError::invalid(format!(
                    "mechanism {mechanism:?} cannot release under measure {measure:?}"
                )))
            }
        }

        Ok((sensitivity, measurement, measure))
    }
}

impl Querier for OpendpQuerier {
    fn library(&self) -> Library {
        Library::Opendp
    }

    fn validate(
        &self,
        metadata: &Metadata,
        payload: &serde_json::Value,
    ) -> Result<(), QueryError> {
        let payload: OpendpPayload = parse_payload(self.library(), payload)?;
        if let Some(delta) = payload.fixed_delta {
            if !(0.0..1.0).contains(&delta) || delta == 0.0 {
                return Err(QueryError::invalid("fixed_delta must be in (0, 1)"));
            }
        }
        // A transformation-only pipeline is structurally sound; it is the
        // backend that refuses it, at cost time.
        self.walk(metadata, &payload.pipeline).map(|_| ())
    }

    fn estimate_cost(
        &self,
        metadata: &Metadata,
        payload: &serde_json::Value,
    ) -> Result<Cost, QueryError> {
        let payload: OpendpPayload = parse_payload(self.library(), payload)?;
        let (sensitivity, measurement, measure) = self.relation(metadata, &payload)?;

        match measure {
            OutputMeasure::MaxDivergence => {
                if payload.fixed_delta.is_some() {
                    return Err(QueryError::invalid(
                        "fixed_delta is only accepted for smoothed or zero-concentrated measures",
                    ));
                }
                Ok(Cost::new(sensitivity / measurement.scale, 0.0))
            }
            OutputMeasure::FixedSmoothedMaxDivergence { delta } => {
                if payload.fixed_delta.is_some() {
                    return Err(QueryError::invalid(
                        "fixed_delta is only accepted for smoothed or zero-concentrated measures",
                    ));
                }
                let epsilon =
                    sensitivity / measurement.scale * (2.0 * (1.25 / delta).ln()).sqrt();
                Ok(Cost::new(epsilon, delta))
            }
            OutputMeasure::SmoothedMaxDivergence => {
                let delta = payload.fixed_delta.ok_or_else(|| {
                    QueryError::invalid(
                        "fixed_delta must be set for smoothed max divergence \
                         and zero concentrated divergence",
                    )
                })?;
                let epsilon =
                    sensitivity / measurement.scale * (2.0 * (1.25 / delta).ln()).sqrt();
                Ok(Cost::new(epsilon, delta))
            }
            OutputMeasure::ZeroConcentratedDivergence => {
                let delta = payload.fixed_delta.ok_or_else(|| {
                    QueryError::invalid(
                        "fixed_delta must be set for smoothed max divergence \
                         and zero concentrated divergence",
                    )
                })?;
                // zCDP rho, composed to approximate DP at the supplied delta
                let rho = (sensitivity / measurement.scale).powi(2) / 2.0;
                let epsilon = rho + 2.0 * (rho * (1.0 / delta).ln()).sqrt();
                Ok(Cost::new(epsilon, delta))
            }
        }
    }

    fn execute(
        &self,
        metadata: &Metadata,
        view: &TabularView,
        payload: &serde_json::Value,
    ) -> Result<QueryResult, QueryError> {
        let payload: OpendpPayload = parse_payload(self.library(), payload)?;
        let (column, bounds, agg) = self.walk(metadata, &payload.pipeline)?;
        let (_, measurement, _) = self.relation(metadata, &payload)?;

        let true_value = match agg {
            Some(AggState::Count) => view.num_rows() as f64,
            Some(AggState::Sum { .. }) => {
                let name = column
                    .as_deref()
                    .ok_or_else(|| QueryError::internal("sum pipeline without a column"))?;
                let (lower, upper) = bounds
                    .ok_or_else(|| QueryError::internal("sum pipeline without clamp bounds"))?;
                view.float_column(name)?
                    .iter()
                    .map(|v| v.clamp(lower, upper))
                    .sum()
            }
            None => {
                return Err(QueryError::external(
                    Library::Opendp,
                    "the pipeline does not aggregate; row-level releases are refused",
                ))
            }
        };

        let released = match measurement.mechanism {
            MechanismKind::Laplace => true_value + laplace_noise(measurement.scale),
            MechanismKind::Gaussian => true_value + gaussian_noise(measurement.scale)?,
        };
        Ok(QueryResult::Scalar { value: released })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn metadata() -> Metadata {
        let mut columns = IndexMap::new();
        columns.insert(
            "income".to_string(),
            ColumnSpec::Float {
                lower: 0.0,
                upper: 100_000.0,
                nullable: false,
            },
        );
        Metadata {
            max_ids: 1,
            rows: 1000,
            columns,
        }
    }

    fn count_pipeline(mechanism: &str, scale: f64) -> serde_json::Value {
        serde_json::json!({
            "pipeline": {
                "input_metric": "symmetric_distance",
                "transformations": [ {"name": "count"} ],
                "measurement": { "mechanism": mechanism, "scale": scale },
            }
        })
    }

    #[test]
    fn laplace_count_is_pure_dp() {
        let querier = OpendpQuerier::new(OpendpFeatures::default());
        let cost = querier
            .estimate_cost(&metadata(), &count_pipeline("laplace", 2.0))
            .unwrap();
        assert!((cost.epsilon - 0.5).abs() < 1e-12);
        assert_eq!(cost.delta, 0.0);
    }

    #[test]
    fn transformation_only_pipeline_is_external_lib() {
        let querier = OpendpQuerier::new(OpendpFeatures::default());
        let payload = serde_json::json!({
            "pipeline": {
                "input_metric": "symmetric_distance",
                "transformations": [
                    {"name": "select", "column": "income"},
                    {"name": "clamp", "lower": 0.0, "upper": 100000.0},
                ],
            }
        });
        // Structurally valid...
        querier.validate(&metadata(), &payload).unwrap();
        // ...but refused by the backend at cost time.
        let err = querier.estimate_cost(&metadata(), &payload).unwrap_err();
        assert!(matches!(err, QueryError::ExternalLib { .. }));
    }

    #[test]
    fn zcdp_requires_fixed_delta() {
        let querier = OpendpQuerier::new(OpendpFeatures::default());
        let err = querier
            .estimate_cost(&metadata(), &count_pipeline("gaussian", 2.0))
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery { .. }));

        let mut payload = count_pipeline("gaussian", 2.0);
        payload["fixed_delta"] = serde_json::json!(1e-6);
        let cost = querier.estimate_cost(&metadata(), &payload).unwrap();
        assert!(cost.epsilon > 0.0);
        assert!((cost.delta - 1e-6).abs() < 1e-18);
    }

    #[test]
    fn fixed_delta_on_pure_pipeline_is_invalid() {
        let querier = OpendpQuerier::new(OpendpFeatures::default());
        let mut payload = count_pipeline("laplace", 2.0);
        payload["fixed_delta"] = serde_json::json!(1e-6);
        let err = querier.estimate_cost(&metadata(), &payload).unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery { .. }));
    }

    #[test]
    fn gaussian_gated_behind_contrib() {
        let querier = OpendpQuerier::new(OpendpFeatures {
            contrib: false,
            floating_point: true,
        });
        let mut payload = count_pipeline("gaussian", 2.0);
        payload["fixed_delta"] = serde_json::json!(1e-6);
        let err = querier.estimate_cost(&metadata(), &payload).unwrap_err();
        assert!(matches!(err, QueryError::ExternalLib { .. }));
    }

    #[test]
    fn sum_without_clamp_is_refused_by_backend() {
        let querier = OpendpQuerier::new(OpendpFeatures::default());
        let payload = serde_json::json!({
            "pipeline": {
                "input_metric": "symmetric_distance",
                "transformations": [
                    {"name": "select", "column": "income"},
                    {"name": "sum"},
                ],
                "measurement": { "mechanism": "laplace", "scale": 100.0 },
            }
        });
        let err = querier.estimate_cost(&metadata(), &payload).unwrap_err();
        assert!(matches!(err, QueryError::ExternalLib { .. }));
    }

    #[test]
    fn executes_clamped_sum() {
        let querier = OpendpQuerier::new(OpendpFeatures::default());
        let meta = metadata();
        let view = crate::dataset::dummy::make_dummy_frame(&meta, 200, 3).unwrap();
        let payload = serde_json::json!({
            "pipeline": {
                "input_metric": "symmetric_distance",
                "transformations": [
                    {"name": "select", "column": "income"},
                    {"name": "clamp", "lower": 0.0, "upper": 100000.0},
                    {"name": "sum"},
                ],
                "measurement": { "mechanism": "laplace", "scale": 10.0 },
            }
        });
        match querier.execute(&meta, &view, &payload).unwrap() {
            QueryResult::Scalar { value } => assert!(value.is_finite()),
            other => panic!("expected scalar, got {other:?}"),
        }
    }
}
