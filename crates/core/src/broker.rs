//! The task broker: bounded FIFO work queues per backend library and the
//! worker pool that executes admitted jobs.
//!
//! The broker runs in-process with a bounded worker pool; the admission and
//! compensation contract is independent of where workers run. Replies
//! travel over per-job oneshot channels, which makes reply delivery
//! single-shot by construction; a reply whose receiver has gone away (an
//! orphaned request) is discarded.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info_span, Instrument};
use uuid::Uuid;

use veil_common::config::BrokerSettings;
use veil_common::models::{Library, Metadata, QueryResult};
use veil_common::QueryError;

use crate::dataset::ConnectorCache;
use crate::frame::TabularView;
use crate::queriers::QuerierRegistry;

/// Terminal outcome of a job, as reported by a worker.
#[derive(Debug)]
pub enum ExecOutcome {
    Ok(QueryResult),
    /// The backend refused or failed deterministically; the engine
    /// compensates the debit.
    LibFail(String),
    /// Worker fault or infrastructure failure; the debit stands.
    InternalFail(String),
}

/// What a job executes against.
#[derive(Debug, Clone)]
pub enum JobSource {
    /// The shared connector for the job's dataset.
    Production,
    /// A synthetic frame; never touches the connector cache.
    Dummy {
        metadata: Metadata,
        view: TabularView,
    },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub user_name: String,
    pub dataset_name: String,
    pub library: Library,
    pub payload: serde_json::Value,
    pub source: JobSource,
}

/// Job lifecycle; transitions are worker-driven once queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
}

type Dispatch = (Job, oneshot::Sender<ExecOutcome>);

/// A reserved queue slot. Reservation happens before the budget debit so
/// back-pressure rejections never cost the user anything.
pub struct JobSlot {
    permit: mpsc::OwnedPermit<Dispatch>,
    tracker: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

pub struct TaskBroker {
    partitions: HashMap<Library, mpsc::Sender<Dispatch>>,
    tracker: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

impl TaskBroker {
    /// Spawn the per-library partitions and their worker pools.
    pub fn start(
        settings: BrokerSettings,
        workers: usize,
        connectors: Arc<ConnectorCache>,
        registry: Arc<QuerierRegistry>,
    ) -> Arc<Self> {
        let tracker: Arc<Mutex<HashMap<Uuid, JobState>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut partitions = HashMap::new();

        for library in Library::ALL {
            let (tx, rx) = mpsc::channel::<Dispatch>(settings.queue_depth.max(1));
            let rx = Arc::new(Mutex::new(rx));
            for worker_id in 0..workers.max(1) {
                let span = info_span!("worker", library = %library, worker_id);
                tokio::spawn(
                    worker_loop(
                        rx.clone(),
                        connectors.clone(),
                        registry.clone(),
                        tracker.clone(),
                    )
                    .instrument(span),
                );
            }
            partitions.insert(library, tx);
        }

        Arc::new(Self {
            partitions,
            tracker,
        })
    }

    /// Reserve a slot on the library's partition, failing fast with a
    /// retryable signal when the backlog is at its high-water mark.
    pub fn reserve(&self, library: Library) -> Result<JobSlot, QueryError> {
        let sender = self
            .partitions
            .get(&library)
            .ok_or_else(|| QueryError::internal(format!("no partition for {library}")))?
            .clone();
        match sender.try_reserve_owned() {
            Ok(permit) => Ok(JobSlot {
                permit,
                tracker: self.tracker.clone(),
            }),
            Err(mpsc::error::TrySendError::Full(_)) => Err(QueryError::busy(format!(
                "the {library} queue is at capacity; retry shortly"
            ))),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(QueryError::internal(format!("{library} workers are gone")))
            }
        }
    }

    /// Enqueue a job on a previously reserved slot.
    pub async fn dispatch(&self, slot: JobSlot, job: Job) -> oneshot::Receiver<ExecOutcome> {
        let (tx, rx) = oneshot::channel();
        debug!(job_id = %job.job_id, library = %job.library, "job queued");
        slot.tracker.lock().await.insert(job.job_id, JobState::Queued);
        slot.permit.send((job, tx));
        rx
    }

    /// Current lifecycle state of a job, if it is still live.
    pub async fn job_state(&self, job_id: Uuid) -> Option<JobState> {
        self.tracker.lock().await.get(&job_id).copied()
    }
}

async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<Dispatch>>>,
    connectors: Arc<ConnectorCache>,
    registry: Arc<QuerierRegistry>,
    tracker: Arc<Mutex<HashMap<Uuid, JobState>>>,
) {
    loop {
        let dispatch = { rx.lock().await.recv().await };
        let Some((job, reply)) = dispatch else {
            break;
        };
        let job_id = job.job_id;
        tracker.lock().await.insert(job_id, JobState::Running);
        debug!(job_id = %job_id, "job running");

        let outcome = run_job(job, &connectors, &registry).await;
        tracker.lock().await.remove(&job_id);

        if reply.send(outcome).is_err() {
            // Receiver gone: the request was cancelled or timed out.
            debug!(job_id = %job_id, "discarding orphaned job result");
        }
    }
}

async fn run_job(
    job: Job,
    connectors: &ConnectorCache,
    registry: &QuerierRegistry,
) -> ExecOutcome {
    let querier = match registry.get(job.library) {
        Ok(querier) => querier,
        Err(e) => return ExecOutcome::InternalFail(e.to_string()),
    };

    let (metadata, view) = match job.source {
        JobSource::Production => match connectors.acquire(&job.dataset_name).await {
            Ok(connector) => (connector.metadata().clone(), connector.as_tabular()),
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "connector materialization failed");
                return ExecOutcome::InternalFail(e.to_string());
            }
        },
        JobSource::Dummy { metadata, view } => (metadata, view),
    };

    let payload = job.payload;
    let handle =
        tokio::task::spawn_blocking(move || querier.execute(&metadata, &view, &payload));

    match handle.await {
        Err(join_error) => {
            error!(job_id = %job.job_id, error = %join_error, "worker died mid-job");
            ExecOutcome::InternalFail(format!("worker died mid-job: {join_error}"))
        }
        Ok(Ok(result)) => ExecOutcome::Ok(result),
        // Deterministic backend refusals; safe to compensate.
        Ok(Err(QueryError::ExternalLib { message, .. })) => ExecOutcome::LibFail(message),
        Ok(Err(e)) => ExecOutcome::InternalFail(e.to_string()),
    }
}
