use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueryError;

/// The closed set of DP backend libraries recognized by the service.
///
/// Wire tags follow the library names clients know
/// (`smartnoise_sql`, `opendp`, `smartnoise_synth`, `diffprivlib`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Library {
    SmartnoiseSql,
    Opendp,
    SmartnoiseSynth,
    Diffprivlib,
}

impl Library {
    pub const ALL: [Library; 4] = [
        Library::SmartnoiseSql,
        Library::Opendp,
        Library::SmartnoiseSynth,
        Library::Diffprivlib,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Library::SmartnoiseSql => "smartnoise_sql",
            Library::Opendp => "opendp",
            Library::SmartnoiseSynth => "smartnoise_synth",
            Library::Diffprivlib => "diffprivlib",
        }
    }
}

impl std::fmt::Display for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Library {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smartnoise_sql" => Ok(Library::SmartnoiseSql),
            "opendp" => Ok(Library::Opendp),
            "smartnoise_synth" => Ok(Library::SmartnoiseSynth),
            "diffprivlib" => Ok(Library::Diffprivlib),
            other => Err(QueryError::invalid(format!("unknown DP library: {other}"))),
        }
    }
}

/// An (ε, δ) privacy budget pair.
///
/// Costs compose additively along the sum rule; any pre-composition
/// (e.g. zCDP conversion) happens inside the backend that reports the cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Cost {
    pub epsilon: f64,
    pub delta: f64,
}

impl Cost {
    pub const ZERO: Cost = Cost {
        epsilon: 0.0,
        delta: 0.0,
    };

    pub fn new(epsilon: f64, delta: f64) -> Self {
        Self { epsilon, delta }
    }

    /// Component-wise sum.
    pub fn add(&self, other: &Cost) -> Cost {
        Cost {
            epsilon: self.epsilon + other.epsilon,
            delta: self.delta + other.delta,
        }
    }

    /// Component-wise difference, clamped at zero so float drift can never
    /// produce a negative spent value.
    pub fn saturating_sub(&self, other: &Cost) -> Cost {
        Cost {
            epsilon: (self.epsilon - other.epsilon).max(0.0),
            delta: (self.delta - other.delta).max(0.0),
        }
    }

    /// True if either coordinate exceeds the corresponding bound, with a
    /// small tolerance so budgets can be spent down to exactly zero.
    pub fn exceeds(&self, bound: &Cost) -> bool {
        self.epsilon > bound.epsilon + 1e-12 || self.delta > bound.delta + 1e-12
    }

    pub fn is_valid(&self) -> bool {
        self.epsilon >= 0.0 && (0.0..1.0).contains(&self.delta)
    }
}

// Users and budgets
// ---------------------------------------------------------------------------

/// Per-dataset budget state of a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetEntry {
    pub dataset_name: String,
    pub initial_epsilon: f64,
    pub initial_delta: f64,
    #[serde(default)]
    pub total_spent_epsilon: f64,
    #[serde(default)]
    pub total_spent_delta: f64,
}

impl BudgetEntry {
    pub fn new(dataset_name: impl Into<String>, initial: Cost) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            initial_epsilon: initial.epsilon,
            initial_delta: initial.delta,
            total_spent_epsilon: 0.0,
            total_spent_delta: 0.0,
        }
    }

    pub fn initial(&self) -> Cost {
        Cost::new(self.initial_epsilon, self.initial_delta)
    }

    pub fn spent(&self) -> Cost {
        Cost::new(self.total_spent_epsilon, self.total_spent_delta)
    }

    pub fn remaining(&self) -> Cost {
        self.initial().saturating_sub(&self.spent())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_name: String,
    pub may_query: bool,
    #[serde(default)]
    pub datasets: Vec<BudgetEntry>,
}

impl User {
    pub fn budget_for(&self, dataset_name: &str) -> Option<&BudgetEntry> {
        self.datasets
            .iter()
            .find(|e| e.dataset_name == dataset_name)
    }
}

// Datasets and access descriptors
// ---------------------------------------------------------------------------

/// Where the sensitive data physically lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetAccess {
    Path {
        path: String,
    },
    S3 {
        endpoint_url: String,
        bucket: String,
        key: String,
        credentials_name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub dataset_name: String,
    pub access: DatasetAccess,
}

// Metadata
// ---------------------------------------------------------------------------

/// Column schema of a sensitive dataset, tagged by `type`.
///
/// Categorical columns carry an explicit category list; its length is the
/// cardinality. Numeric and datetime columns carry bounds with
/// `lower <= upper`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnSpec {
    String {
        #[serde(default)]
        categories: Option<Vec<String>>,
        #[serde(default)]
        nullable: bool,
    },
    Int {
        lower: i64,
        upper: i64,
        #[serde(default)]
        categories: Option<Vec<i64>>,
        #[serde(default)]
        nullable: bool,
    },
    Float {
        lower: f64,
        upper: f64,
        #[serde(default)]
        nullable: bool,
    },
    Bool {
        #[serde(default)]
        nullable: bool,
    },
    Datetime {
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
        #[serde(default)]
        nullable: bool,
    },
}

impl ColumnSpec {
    pub fn nullable(&self) -> bool {
        match self {
            ColumnSpec::String { nullable, .. }
            | ColumnSpec::Int { nullable, .. }
            | ColumnSpec::Float { nullable, .. }
            | ColumnSpec::Bool { nullable }
            | ColumnSpec::Datetime { nullable, .. } => *nullable,
        }
    }

    fn validate(&self, name: &str) -> Result<(), QueryError> {
        match self {
            ColumnSpec::Int { lower, upper, .. } if lower > upper => Err(QueryError::invalid(
                format!("column {name}: lower bound above upper bound"),
            )),
            ColumnSpec::Float { lower, upper, .. } if lower > upper => Err(QueryError::invalid(
                format!("column {name}: lower bound above upper bound"),
            )),
            ColumnSpec::Datetime { lower, upper, .. } if lower > upper => Err(QueryError::invalid(
                format!("column {name}: lower bound above upper bound"),
            )),
            ColumnSpec::String {
                categories: Some(cats),
                ..
            } if cats.is_empty() => Err(QueryError::invalid(format!(
                "column {name}: empty category list"
            ))),
            _ => Ok(()),
        }
    }
}

/// Dataset metadata as registered by the administrator.
///
/// `columns` preserves registration order; dummy frames and tabular views
/// reproduce exactly this order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub max_ids: u64,
    pub rows: u64,
    pub columns: IndexMap<String, ColumnSpec>,
}

impl Metadata {
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.max_ids < 1 {
            return Err(QueryError::invalid("metadata: max_ids must be >= 1"));
        }
        for (name, spec) in &self.columns {
            spec.validate(name)?;
        }
        Ok(())
    }
}

// Archives
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Ok,
    LibFail,
    InternalFail,
    Compensated,
}

/// Append-only record of an accepted production query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub job_id: Uuid,
    pub user_name: String,
    pub dataset_name: String,
    pub library: Library,
    /// sha256 hex of the submitted payload; the payload itself is never
    /// archived so connector credentials cannot leak through archive reads.
    pub payload_hash: String,
    pub epsilon: f64,
    pub delta: f64,
    pub status: ArchiveStatus,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

// Results and wire responses
// ---------------------------------------------------------------------------

/// The shape-polymorphic result of a backend execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum QueryResult {
    Scalar {
        value: f64,
    },
    Vector {
        values: Vec<f64>,
    },
    Tabular {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
}

impl QueryResult {
    pub fn n_rows(&self) -> usize {
        match self {
            QueryResult::Scalar { .. } => 1,
            QueryResult::Vector { values } => values.len(),
            QueryResult::Tabular { rows, .. } => rows.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostResponse {
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetResponse {
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub requested_by: String,
    pub epsilon: f64,
    pub delta: f64,
    pub result: QueryResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with(name: &str, spec: ColumnSpec) -> Metadata {
        let mut columns = IndexMap::new();
        columns.insert(name.to_string(), spec);
        Metadata {
            max_ids: 1,
            rows: 100,
            columns,
        }
    }

    #[test]
    fn cost_exceeds_is_per_coordinate() {
        let bound = Cost::new(10.0, 0.005);
        assert!(!Cost::new(10.0, 0.005).exceeds(&bound));
        assert!(Cost::new(10.1, 0.0).exceeds(&bound));
        assert!(Cost::new(0.0, 0.006).exceeds(&bound));
    }

    #[test]
    fn saturating_sub_clamps_at_zero() {
        let spent = Cost::new(1.0, 1e-4);
        let credit = Cost::new(2.0, 2e-4);
        assert_eq!(spent.saturating_sub(&credit), Cost::ZERO);
    }

    #[test]
    fn metadata_rejects_inverted_bounds() {
        let meta = meta_with(
            "age",
            ColumnSpec::Int {
                lower: 90,
                upper: 0,
                categories: None,
                nullable: false,
            },
        );
        assert!(meta.validate().is_err());
    }

    #[test]
    fn library_wire_tags_round_trip() {
        for lib in Library::ALL {
            let tag = serde_json::to_string(&lib).unwrap();
            let back: Library = serde_json::from_str(&tag).unwrap();
            assert_eq!(back, lib);
        }
        assert_eq!(
            serde_json::to_string(&Library::SmartnoiseSql).unwrap(),
            "\"smartnoise_sql\""
        );
    }

    #[test]
    fn budget_entry_remaining() {
        let mut entry = BudgetEntry::new("penguin", Cost::new(10.0, 0.005));
        entry.total_spent_epsilon = 1.0;
        entry.total_spent_delta = 5e-5;
        let remaining = entry.remaining();
        assert!((remaining.epsilon - 9.0).abs() < 1e-12);
        assert!((remaining.delta - 0.00495).abs() < 1e-12);
    }
}
