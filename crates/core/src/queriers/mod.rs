//! The DP backend registry and the backend adapters.
//!
//! Each adapter implements the [`Querier`] capability: structural payload
//! validation, pure cost estimation against dataset metadata, and execution
//! against a tabular view. The engine never inspects payload semantics
//! beyond dispatching on the library tag.

mod diffprivlib;
mod opendp;
mod smartnoise_sql;
mod smartnoise_synth;

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::de::DeserializeOwned;

use veil_common::config::DpLibrariesConfig;
use veil_common::models::{Cost, Library, Metadata, QueryResult};
use veil_common::QueryError;

use crate::frame::TabularView;

pub use diffprivlib::DiffprivlibQuerier;
pub use opendp::OpendpQuerier;
pub use smartnoise_sql::SmartnoiseSqlQuerier;
pub use smartnoise_synth::SmartnoiseSynthQuerier;

/// A DP backend adapter.
///
/// `validate` and `estimate_cost` are pure; `execute` runs on a worker and
/// owns its noise mechanisms. Execution errors distinguish deterministic
/// backend refusals (`ExternalLib`, compensated by the engine) from faults
/// (`Internal`, debit stands).
pub trait Querier: Send + Sync {
    fn library(&self) -> Library;

    fn validate(&self, metadata: &Metadata, payload: &serde_json::Value)
        -> Result<(), QueryError>;

    fn estimate_cost(
        &self,
        metadata: &Metadata,
        payload: &serde_json::Value,
    ) -> Result<Cost, QueryError>;

    fn execute(
        &self,
        metadata: &Metadata,
        view: &TabularView,
        payload: &serde_json::Value,
    ) -> Result<QueryResult, QueryError>;
}

/// Process-wide registry of backend adapters, built once at startup.
pub struct QuerierRegistry {
    queriers: HashMap<Library, Arc<dyn Querier>>,
}

impl QuerierRegistry {
    pub fn new() -> Self {
        Self {
            queriers: HashMap::new(),
        }
    }

    /// Registry with all four recognized backends.
    pub fn with_defaults(config: &DpLibrariesConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SmartnoiseSqlQuerier::new()));
        registry.register(Arc::new(OpendpQuerier::new(config.opendp)));
        registry.register(Arc::new(SmartnoiseSynthQuerier::new()));
        registry.register(Arc::new(DiffprivlibQuerier::new()));
        registry
    }

    pub fn register(&mut self, querier: Arc<dyn Querier>) {
        self.queriers.insert(querier.library(), querier);
    }

    pub fn get(&self, library: Library) -> Result<Arc<dyn Querier>, QueryError> {
        self.queriers
            .get(&library)
            .cloned()
            .ok_or_else(|| QueryError::internal(format!("no querier registered for {library}")))
    }
}

impl Default for QuerierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Deserialize a backend payload, mapping discrimination failure to
/// `InvalidQuery`.
pub(crate) fn parse_payload<T: DeserializeOwned>(
    library: Library,
    payload: &serde_json::Value,
) -> Result<T, QueryError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| QueryError::invalid(format!("malformed {library} payload: {e}")))
}

// Noise primitives shared by the adapters
// ---------------------------------------------------------------------------

/// A centered Laplace draw with the given scale (inverse CDF of a uniform).
pub(crate) fn laplace_noise(scale: f64) -> f64 {
    let u: f64 = rand::thread_rng().gen_range(-0.5..0.5);
    -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
}

/// A centered Gaussian draw with the given standard deviation.
pub(crate) fn gaussian_noise(sigma: f64) -> Result<f64, QueryError> {
    let normal = Normal::new(0.0, sigma)
        .map_err(|e| QueryError::internal(format!("invalid gaussian parameter: {e}")))?;
    Ok(normal.sample(&mut rand::thread_rng()))
}

/// Standard deviation calibrating a Gaussian mechanism to (ε, δ).
pub(crate) fn gaussian_sigma(sensitivity: f64, epsilon: f64, delta: f64) -> f64 {
    sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon
}
