//! Arrow-backed tabular views and conversions between dataset metadata,
//! raw CSV bytes, and wire results.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{
    Array, BooleanArray, Float64Array, Int64Array, StringArray, TimestampSecondArray,
};
use arrow::compute::concat_batches;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;

use veil_common::models::{ColumnSpec, Metadata, QueryResult};
use veil_common::QueryError;

/// A read-only, shareable view over a materialized dataset.
///
/// Cloning is cheap: the underlying arrow arrays are reference counted.
#[derive(Debug, Clone)]
pub struct TabularView {
    batch: RecordBatch,
}

impl TabularView {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Non-null values of a numeric column, widened to `f64`.
    pub fn float_column(&self, name: &str) -> Result<Vec<f64>, QueryError> {
        let index = self
            .batch
            .schema()
            .index_of(name)
            .map_err(|_| QueryError::invalid(format!("unknown column: {name}")))?;
        let column = self.batch.column(index);
        match column.data_type() {
            DataType::Int64 => {
                let array = column
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .ok_or_else(|| QueryError::internal("int column downcast failed"))?;
                Ok(array.iter().flatten().map(|v| v as f64).collect())
            }
            DataType::Float64 => {
                let array = column
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| QueryError::internal("float column downcast failed"))?;
                Ok(array.iter().flatten().collect())
            }
            other => Err(QueryError::invalid(format!(
                "column {name} is not numeric (found {other})"
            ))),
        }
    }

    /// Non-null values of a string column.
    pub fn string_column(&self, name: &str) -> Result<Vec<String>, QueryError> {
        let index = self
            .batch
            .schema()
            .index_of(name)
            .map_err(|_| QueryError::invalid(format!("unknown column: {name}")))?;
        let column = self.batch.column(index);
        let array = column
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| QueryError::invalid(format!("column {name} is not a string column")))?;
        Ok(array.iter().flatten().map(|s| s.to_string()).collect())
    }

    /// Non-null values of a boolean column.
    pub fn bool_column(&self, name: &str) -> Result<Vec<bool>, QueryError> {
        let index = self
            .batch
            .schema()
            .index_of(name)
            .map_err(|_| QueryError::invalid(format!("unknown column: {name}")))?;
        let column = self.batch.column(index);
        let array = column
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| QueryError::invalid(format!("column {name} is not a boolean column")))?;
        Ok(array.iter().flatten().collect())
    }

    /// Render the view as a wire result, row-major.
    pub fn to_result(&self) -> Result<QueryResult, QueryError> {
        let schema = self.batch.schema();
        let columns: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();
        let mut rows = Vec::with_capacity(self.batch.num_rows());
        for row in 0..self.batch.num_rows() {
            let mut values = Vec::with_capacity(columns.len());
            for col in 0..self.batch.num_columns() {
                values.push(cell_to_json(self.batch.column(col).as_ref(), row)?);
            }
            rows.push(values);
        }
        Ok(QueryResult::Tabular { columns, rows })
    }
}

fn cell_to_json(array: &dyn Array, row: usize) -> Result<serde_json::Value, QueryError> {
    if array.is_null(row) {
        return Ok(serde_json::Value::Null);
    }
    let value = match array.data_type() {
        DataType::Int64 => {
            let a = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| QueryError::internal("int column downcast failed"))?;
            serde_json::json!(a.value(row))
        }
        DataType::Float64 => {
            let a = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| QueryError::internal("float column downcast failed"))?;
            serde_json::json!(a.value(row))
        }
        DataType::Utf8 => {
            let a = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| QueryError::internal("string column downcast failed"))?;
            serde_json::json!(a.value(row))
        }
        DataType::Boolean => {
            let a = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| QueryError::internal("bool column downcast failed"))?;
            serde_json::json!(a.value(row))
        }
        DataType::Timestamp(TimeUnit::Second, _) => {
            let a = array
                .as_any()
                .downcast_ref::<TimestampSecondArray>()
                .ok_or_else(|| QueryError::internal("timestamp column downcast failed"))?;
            let ts = DateTime::from_timestamp(a.value(row), 0)
                .ok_or_else(|| QueryError::internal("timestamp out of range"))?;
            serde_json::json!(ts.to_rfc3339())
        }
        other => {
            return Err(QueryError::internal(format!(
                "unsupported column type in view: {other}"
            )))
        }
    };
    Ok(value)
}

/// Arrow schema corresponding to dataset metadata, in registration order.
pub fn arrow_schema(metadata: &Metadata) -> SchemaRef {
    let fields: Vec<Field> = metadata
        .columns
        .iter()
        .map(|(name, spec)| {
            let data_type = match spec {
                ColumnSpec::String { .. } => DataType::Utf8,
                ColumnSpec::Int { .. } => DataType::Int64,
                ColumnSpec::Float { .. } => DataType::Float64,
                ColumnSpec::Bool { .. } => DataType::Boolean,
                ColumnSpec::Datetime { .. } => DataType::Timestamp(TimeUnit::Second, None),
            };
            Field::new(name, data_type, true)
        })
        .collect();
    Arc::new(Schema::new(fields))
}

/// Decode CSV bytes into a view with the schema derived from metadata.
///
/// The header row must be present; columns are matched by the metadata
/// schema positionally.
pub fn read_csv(metadata: &Metadata, bytes: Vec<u8>) -> Result<TabularView, QueryError> {
    let schema = arrow_schema(metadata);
    let reader = ReaderBuilder::new(schema.clone())
        .with_header(true)
        .build(Cursor::new(bytes))
        .map_err(|e| QueryError::internal(format!("failed to open csv reader: {e}")))?;

    let mut batches = Vec::new();
    for batch in reader {
        batches
            .push(batch.map_err(|e| QueryError::internal(format!("failed to decode csv: {e}")))?);
    }
    let batch = concat_batches(&schema, &batches)
        .map_err(|e| QueryError::internal(format!("failed to assemble record batch: {e}")))?;
    Ok(TabularView::new(batch))
}
