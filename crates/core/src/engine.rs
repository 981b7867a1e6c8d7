//! The admission and budget engine.
//!
//! One production query runs the admission protocol end to end: gate
//! checks, payload normalization, backend cost estimation, a bounded
//! optimistic debit against the admin store, dispatch through the task
//! broker, and terminal archiving. The measured cost is frozen before the
//! debit and is exactly what the ledger records.
//!
//! Compensation policy: a confirmed deterministic backend failure credits
//! the exact debit back; timeouts and worker faults do not (the work may
//! have partially run), so the ledger can over-count but never under-count
//! and `spent <= initial` holds at every observable moment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use veil_common::config::{Config, Secrets};
use veil_common::models::{
    ArchiveEntry, ArchiveStatus, Cost, Library, Metadata, QueryResponse, QueryResult,
};
use veil_common::QueryError;

use crate::broker::{ExecOutcome, Job, JobSource, TaskBroker};
use crate::dataset::dummy::make_dummy_frame;
use crate::dataset::ConnectorCache;
use crate::queriers::QuerierRegistry;
use crate::shaper::TimingShaper;
use crate::store::{AdminStore, CasOutcome};

/// Attempts before a contended ledger write gives up.
const CAS_MAX_ATTEMPTS: usize = 5;

/// Pause between conflicting writes to one budget row. Contention is
/// short-lived (a handful of admissions racing on one version), so the
/// pause grows linearly and stays in the sub-millisecond range; the random
/// component keeps two losers from colliding again in lockstep.
fn conflict_pause(attempt: usize) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..400);
    Duration::from_micros(attempt as u64 * 600 + jitter)
}

/// Budget triplet returned by the budget read operations.
#[derive(Debug, Clone, Copy)]
pub struct BudgetSummary {
    pub initial: Cost,
    pub spent: Cost,
    pub remaining: Cost,
}

pub struct QueryEngine {
    store: Arc<dyn AdminStore>,
    connectors: Arc<ConnectorCache>,
    registry: Arc<QuerierRegistry>,
    broker: Arc<TaskBroker>,
    shaper: TimingShaper,
    submit_limit: usize,
    in_flight: Arc<AtomicUsize>,
    reply_timeout: Duration,
}

impl QueryEngine {
    /// Build the engine and its collaborators from configuration.
    pub fn from_config(config: &Config, secrets: Secrets, store: Arc<dyn AdminStore>) -> Arc<Self> {
        let registry = Arc::new(QuerierRegistry::with_defaults(&config.dp_libraries));
        Self::with_registry(config, secrets, store, registry)
    }

    /// Build the engine with a caller-supplied backend registry.
    pub fn with_registry(
        config: &Config,
        secrets: Secrets,
        store: Arc<dyn AdminStore>,
        registry: Arc<QuerierRegistry>,
    ) -> Arc<Self> {
        let connectors = Arc::new(ConnectorCache::new(
            config.dataset_cache,
            store.clone(),
            secrets,
        ));
        let broker = TaskBroker::start(
            config.broker,
            config.server.workers,
            connectors.clone(),
            registry.clone(),
        );
        Arc::new(Self {
            store,
            connectors,
            registry,
            broker,
            shaper: TimingShaper::new(config.server.time_attack),
            submit_limit: config.submit_limit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            reply_timeout: Duration::from_secs(config.broker.reply_timeout_secs),
        })
    }

    pub fn store(&self) -> Arc<dyn AdminStore> {
        self.store.clone()
    }

    pub fn connectors(&self) -> &ConnectorCache {
        &self.connectors
    }

    /// Live production admissions, for observability.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    // Public operations
    // -----------------------------------------------------------------------
    // Every terminal response passes through the timing shaper, success and
    // failure alike.

    pub async fn estimate_cost(
        &self,
        user_name: &str,
        library: Library,
        dataset_name: &str,
        payload: &serde_json::Value,
    ) -> Result<Cost, QueryError> {
        let admitted_at = Instant::now();
        let result = self
            .estimate_cost_inner(user_name, library, dataset_name, payload)
            .await;
        self.shaper.shape(admitted_at).await;
        result
    }

    pub async fn execute_query(
        &self,
        user_name: &str,
        library: Library,
        dataset_name: &str,
        payload: &serde_json::Value,
        requested: Cost,
    ) -> Result<QueryResponse, QueryError> {
        let admitted_at = Instant::now();
        let result = self
            .execute_query_inner(user_name, library, dataset_name, payload, requested)
            .await;
        self.shaper.shape(admitted_at).await;
        result
    }

    pub async fn execute_dummy_query(
        &self,
        user_name: &str,
        library: Library,
        dataset_name: &str,
        payload: &serde_json::Value,
        nb_rows: usize,
        seed: u64,
    ) -> Result<QueryResponse, QueryError> {
        let admitted_at = Instant::now();
        let result = self
            .execute_dummy_inner(user_name, library, dataset_name, payload, nb_rows, seed)
            .await;
        self.shaper.shape(admitted_at).await;
        result
    }

    pub async fn get_budget(
        &self,
        user_name: &str,
        dataset_name: &str,
    ) -> Result<BudgetSummary, QueryError> {
        let admitted_at = Instant::now();
        let result = self.store.budget(user_name, dataset_name).await.map(|vb| {
            BudgetSummary {
                initial: vb.entry.initial(),
                spent: vb.entry.spent(),
                remaining: vb.entry.remaining(),
            }
        });
        self.shaper.shape(admitted_at).await;
        result
    }

    pub async fn get_archives(
        &self,
        user_name: &str,
        dataset_name: Option<&str>,
    ) -> Result<Vec<ArchiveEntry>, QueryError> {
        let admitted_at = Instant::now();
        let result = self.get_archives_inner(user_name, dataset_name).await;
        self.shaper.shape(admitted_at).await;
        result
    }

    pub async fn get_metadata(
        &self,
        user_name: &str,
        dataset_name: &str,
    ) -> Result<Metadata, QueryError> {
        let admitted_at = Instant::now();
        let result = self.gate(user_name, dataset_name, false).await;
        self.shaper.shape(admitted_at).await;
        result
    }

    pub async fn get_dummy_frame(
        &self,
        user_name: &str,
        dataset_name: &str,
        nb_rows: usize,
        seed: u64,
    ) -> Result<QueryResult, QueryError> {
        let admitted_at = Instant::now();
        let result = async {
            let metadata = self.gate(user_name, dataset_name, false).await?;
            make_dummy_frame(&metadata, nb_rows, seed)?.to_result()
        }
        .await;
        self.shaper.shape(admitted_at).await;
        result
    }

    // Admission protocol
    // -----------------------------------------------------------------------

    async fn execute_query_inner(
        &self,
        user_name: &str,
        library: Library,
        dataset_name: &str,
        payload: &serde_json::Value,
        requested: Cost,
    ) -> Result<QueryResponse, QueryError> {
        // 1. Gate checks
        let metadata = self.gate(user_name, dataset_name, true).await?;
        let _guard = InFlightGuard::acquire(&self.in_flight, self.submit_limit)?;

        if !requested.is_valid() {
            return Err(QueryError::invalid(
                "requested epsilon must be >= 0 and delta in [0, 1)",
            ));
        }

        // 2. Payload normalization
        let querier = self.registry.get(library)?;
        querier.validate(&metadata, payload)?;

        // 3. Cost estimation: the measured cost is what gets charged.
        let measured = querier.estimate_cost(&metadata, payload)?;
        if !measured.is_valid() {
            return Err(QueryError::internal(format!(
                "{library} produced an invalid cost: epsilon {}, delta {}",
                measured.epsilon, measured.delta
            )));
        }
        if measured.exceeds(&requested) {
            info!(
                user = %user_name,
                dataset = %dataset_name,
                requested_epsilon = requested.epsilon,
                measured_epsilon = measured.epsilon,
                "measured cost exceeds requested cost"
            );
        }

        // Reserve the queue slot before debiting so back-pressure rejections
        // never touch the ledger.
        let slot = self.broker.reserve(library)?;

        // 4–5. Budget pre-check and bounded optimistic debit
        self.debit(user_name, dataset_name, measured).await?;

        // 6. Enqueue
        let job_id = Uuid::new_v4();
        let submitted_at = Utc::now();
        let job = Job {
            job_id,
            user_name: user_name.to_string(),
            dataset_name: dataset_name.to_string(),
            library,
            payload: payload.clone(),
            source: JobSource::Production,
        };
        let reply = self.broker.dispatch(slot, job).await;

        // 7. Await; caller cancellation does not reverse the debit.
        let outcome = match tokio::time::timeout(self.reply_timeout, reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ExecOutcome::InternalFail("worker dropped the reply channel".into()),
            Err(_) => ExecOutcome::InternalFail(format!(
                "no reply within {}s",
                self.reply_timeout.as_secs()
            )),
        };

        // 8. Terminal disposition
        let archive = |status: ArchiveStatus| ArchiveEntry {
            job_id,
            user_name: user_name.to_string(),
            dataset_name: dataset_name.to_string(),
            library,
            payload_hash: hash_payload(payload),
            epsilon: measured.epsilon,
            delta: measured.delta,
            status,
            submitted_at,
            completed_at: Utc::now(),
        };

        match outcome {
            ExecOutcome::Ok(result) => {
                self.store.append_archive(archive(ArchiveStatus::Ok)).await?;
                info!(job_id = %job_id, user = %user_name, dataset = %dataset_name, "query succeeded");
                Ok(QueryResponse {
                    requested_by: user_name.to_string(),
                    epsilon: measured.epsilon,
                    delta: measured.delta,
                    result,
                })
            }
            ExecOutcome::LibFail(message) => {
                self.compensate(user_name, dataset_name, measured).await;
                self.append_archive_best_effort(archive(ArchiveStatus::Compensated))
                    .await;
                Err(QueryError::external(library, message))
            }
            ExecOutcome::InternalFail(message) => {
                // The debit stands; the work may have partially run.
                warn!(job_id = %job_id, error = %message, "query failed internally; debit stands");
                self.append_archive_best_effort(archive(ArchiveStatus::InternalFail))
                    .await;
                Err(QueryError::internal(message))
            }
        }
    }

    async fn execute_dummy_inner(
        &self,
        user_name: &str,
        library: Library,
        dataset_name: &str,
        payload: &serde_json::Value,
        nb_rows: usize,
        seed: u64,
    ) -> Result<QueryResponse, QueryError> {
        // Access grant is still required; the budget ledger is not touched.
        let metadata = self.gate(user_name, dataset_name, false).await?;
        let _guard = InFlightGuard::acquire(&self.in_flight, self.submit_limit)?;

        let querier = self.registry.get(library)?;
        querier.validate(&metadata, payload)?;
        let cost = querier.estimate_cost(&metadata, payload)?;

        let view = make_dummy_frame(&metadata, nb_rows, seed)?;
        let slot = self.broker.reserve(library)?;
        let job = Job {
            job_id: Uuid::new_v4(),
            user_name: user_name.to_string(),
            dataset_name: dataset_name.to_string(),
            library,
            payload: payload.clone(),
            source: JobSource::Dummy {
                metadata: metadata.clone(),
                view,
            },
        };
        let reply = self.broker.dispatch(slot, job).await;

        let outcome = match tokio::time::timeout(self.reply_timeout, reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ExecOutcome::InternalFail("worker dropped the reply channel".into()),
            Err(_) => ExecOutcome::InternalFail(format!(
                "no reply within {}s",
                self.reply_timeout.as_secs()
            )),
        };

        match outcome {
            ExecOutcome::Ok(result) => Ok(QueryResponse {
                requested_by: user_name.to_string(),
                epsilon: cost.epsilon,
                delta: cost.delta,
                result,
            }),
            ExecOutcome::LibFail(message) => Err(QueryError::external(library, message)),
            ExecOutcome::InternalFail(message) => Err(QueryError::internal(message)),
        }
    }

    async fn estimate_cost_inner(
        &self,
        user_name: &str,
        library: Library,
        dataset_name: &str,
        payload: &serde_json::Value,
    ) -> Result<Cost, QueryError> {
        let metadata = self.gate(user_name, dataset_name, false).await?;
        let querier = self.registry.get(library)?;
        querier.validate(&metadata, payload)?;
        querier.estimate_cost(&metadata, payload)
    }

    async fn get_archives_inner(
        &self,
        user_name: &str,
        dataset_name: Option<&str>,
    ) -> Result<Vec<ArchiveEntry>, QueryError> {
        self.store
            .get_user(user_name)
            .await?
            .ok_or_else(|| QueryError::unauthorized(format!("user {user_name} does not exist")))?;
        self.store.archives_for(user_name, dataset_name).await
    }

    /// Resolve the user, enforce `may_query` for production calls, confirm
    /// the access grant, and resolve the dataset metadata.
    async fn gate(
        &self,
        user_name: &str,
        dataset_name: &str,
        production: bool,
    ) -> Result<Metadata, QueryError> {
        let user = self
            .store
            .get_user(user_name)
            .await?
            .ok_or_else(|| QueryError::unauthorized(format!("user {user_name} does not exist")))?;
        if production && !user.may_query {
            return Err(QueryError::unauthorized(format!(
                "user {user_name} may not query the service"
            )));
        }
        if user.budget_for(dataset_name).is_none() {
            return Err(QueryError::unauthorized(format!(
                "{user_name} does not have access to {dataset_name}"
            )));
        }
        self.store
            .get_metadata(dataset_name)
            .await?
            .ok_or_else(|| QueryError::invalid(format!("unknown dataset: {dataset_name}")))
    }

    /// Pre-check and atomically debit the measured cost; bounded retries on
    /// version conflicts linearize concurrent admissions.
    async fn debit(
        &self,
        user_name: &str,
        dataset_name: &str,
        measured: Cost,
    ) -> Result<(), QueryError> {
        let mut attempt = 0usize;
        loop {
            let vb = self.store.budget(user_name, dataset_name).await?;
            let would_spend = vb.entry.spent().add(&measured);
            if would_spend.exceeds(&vb.entry.initial()) {
                let remaining = vb.entry.remaining();
                return Err(QueryError::invalid(format!(
                    "budget exceeded: epsilon remaining {}, delta remaining {}",
                    remaining.epsilon, remaining.delta
                )));
            }
            match self
                .store
                .debit_budget(user_name, dataset_name, vb.version, measured)
                .await?
            {
                CasOutcome::Applied => return Ok(()),
                CasOutcome::Conflict => {
                    attempt += 1;
                    if attempt >= CAS_MAX_ATTEMPTS {
                        return Err(QueryError::internal(format!(
                            "budget contention on ({user_name}, {dataset_name}) \
                             not resolved after {attempt} attempts"
                        )));
                    }
                    tokio::time::sleep(conflict_pause(attempt)).await;
                }
            }
        }
    }

    /// Credit back the exact debit after a confirmed backend failure. A
    /// compensation that cannot be applied is logged as a budget
    /// discrepancy for the operator; it is never retried beyond the bound.
    async fn compensate(&self, user_name: &str, dataset_name: &str, cost: Cost) {
        let mut attempt = 0usize;
        loop {
            let vb = match self.store.budget(user_name, dataset_name).await {
                Ok(vb) => vb,
                Err(e) => {
                    error!(
                        user = %user_name,
                        dataset = %dataset_name,
                        error = %e,
                        "budget discrepancy: compensation read failed"
                    );
                    return;
                }
            };
            match self
                .store
                .credit_budget(user_name, dataset_name, vb.version, cost)
                .await
            {
                Ok(CasOutcome::Applied) => {
                    info!(user = %user_name, dataset = %dataset_name, "budget compensated");
                    return;
                }
                Ok(CasOutcome::Conflict) => {
                    attempt += 1;
                    if attempt >= CAS_MAX_ATTEMPTS {
                        error!(
                            user = %user_name,
                            dataset = %dataset_name,
                            epsilon = cost.epsilon,
                            delta = cost.delta,
                            "budget discrepancy: compensation abandoned after retries"
                        );
                        return;
                    }
                    tokio::time::sleep(conflict_pause(attempt)).await;
                }
                Err(e) => {
                    error!(
                        user = %user_name,
                        dataset = %dataset_name,
                        error = %e,
                        "budget discrepancy: compensation write failed"
                    );
                    return;
                }
            }
        }
    }

    async fn append_archive_best_effort(&self, entry: ArchiveEntry) {
        if let Err(e) = self.store.append_archive(entry).await {
            error!(error = %e, "failed to append archive entry");
        }
    }
}

fn hash_payload(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// RAII guard for the per-process in-flight cap.
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn acquire(counter: &Arc<AtomicUsize>, limit: usize) -> Result<Self, QueryError> {
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            if current >= limit {
                return Err(QueryError::busy(format!(
                    "submit limit of {limit} concurrent queries reached; retry shortly"
                )));
            }
            match counter.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Ok(Self {
                        counter: counter.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
