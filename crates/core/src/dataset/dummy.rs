//! Deterministic dummy-dataset generation.
//!
//! Given the same `(metadata, nb_rows, seed)`, the generated frame is
//! byte-identical on every call: one seeded RNG stream drives all columns
//! in metadata order.

use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
    TimestampSecondArray};
use arrow::record_batch::RecordBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use veil_common::models::{ColumnSpec, Metadata};
use veil_common::QueryError;

use crate::frame::{arrow_schema, TabularView};

pub const DEFAULT_DUMMY_ROWS: usize = 100;
pub const DEFAULT_DUMMY_SEED: u64 = 42;

/// Upper bound on generated rows; protects the server from absurd requests.
pub const MAX_DUMMY_ROWS: usize = 200_000;

/// Probability that a nullable cell is null.
const NULL_PROBABILITY: f64 = 0.0;

/// Pool for non-categorical string columns.
const STRING_POOL: [&str; 8] = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta",
    "theta"];

pub fn make_dummy_frame(
    metadata: &Metadata,
    nb_rows: usize,
    seed: u64,
) -> Result<TabularView, QueryError> {
    if nb_rows > MAX_DUMMY_ROWS {
        return Err(QueryError::invalid(format!(
            "dummy datasets are limited to {MAX_DUMMY_ROWS} rows"
        )));
    }
    metadata.validate()?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(metadata.columns.len());

    for spec in metadata.columns.values() {
        let array: ArrayRef = match spec {
            ColumnSpec::String {
                categories,
                nullable,
            } => {
                let values: Vec<Option<String>> = (0..nb_rows)
                    .map(|_| {
                        if is_null(&mut rng, *nullable) {
                            return None;
                        }
                        let value = match categories {
                            Some(cats) => cats[rng.gen_range(0..cats.len())].clone(),
                            None => STRING_POOL[rng.gen_range(0..STRING_POOL.len())].to_string(),
                        };
                        Some(value)
                    })
                    .collect();
                Arc::new(StringArray::from(values))
            }
            ColumnSpec::Int {
                lower,
                upper,
                categories,
                nullable,
            } => {
                let values: Vec<Option<i64>> = (0..nb_rows)
                    .map(|_| {
                        if is_null(&mut rng, *nullable) {
                            return None;
                        }
                        let value = match categories {
                            Some(cats) => cats[rng.gen_range(0..cats.len())],
                            // integers: inclusive upper bound
                            None => rng.gen_range(*lower..=*upper),
                        };
                        Some(value)
                    })
                    .collect();
                Arc::new(Int64Array::from(values))
            }
            ColumnSpec::Float {
                lower,
                upper,
                nullable,
            } => {
                let values: Vec<Option<f64>> = (0..nb_rows)
                    .map(|_| {
                        if is_null(&mut rng, *nullable) {
                            return None;
                        }
                        // floats: half-open upper bound
                        let value = if upper > lower {
                            rng.gen_range(*lower..*upper)
                        } else {
                            *lower
                        };
                        Some(value)
                    })
                    .collect();
                Arc::new(Float64Array::from(values))
            }
            ColumnSpec::Bool { nullable } => {
                let values: Vec<Option<bool>> = (0..nb_rows)
                    .map(|_| {
                        if is_null(&mut rng, *nullable) {
                            None
                        } else {
                            Some(rng.gen_bool(0.5))
                        }
                    })
                    .collect();
                Arc::new(BooleanArray::from(values))
            }
            ColumnSpec::Datetime {
                lower,
                upper,
                nullable,
            } => {
                let low = lower.timestamp();
                let high = upper.timestamp();
                let values: Vec<Option<i64>> = (0..nb_rows)
                    .map(|_| {
                        if is_null(&mut rng, *nullable) {
                            None
                        } else {
                            Some(rng.gen_range(low..=high))
                        }
                    })
                    .collect();
                Arc::new(TimestampSecondArray::from(values))
            }
        };
        arrays.push(array);
    }

    let batch = RecordBatch::try_new(arrow_schema(metadata), arrays)
        .map_err(|e| QueryError::internal(format!("failed to build dummy frame: {e}")))?;
    Ok(TabularView::new(batch))
}

fn is_null(rng: &mut StdRng, nullable: bool) -> bool {
    nullable && rng.gen_bool(NULL_PROBABILITY)
}
