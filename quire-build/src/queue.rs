//! In-process work queue for builds.
//!
//! `submit` returns a job id immediately; a fixed pool of workers runs the
//! orchestrator off the caller's path, and results stay retrievable by id
//! until they expire.
//!
//! ```text
//! submit ──► bounded mpsc ──► worker 0 ─┐
//!    │                     ├► worker 1 ─┼─► BuildOrchestrator::run
//!    │                     └► worker N ─┘          │
//!    ▼                                             ▼
//! jobs: id → Pending ──────────► Running ──► Finished(BuildResult)
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::job::{BuildJob, BuildResult, JobId};
use crate::orchestrator::BuildOrchestrator;

const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Concurrent builds
    pub workers: usize,
    /// Jobs accepted but not yet picked up
    pub capacity: usize,
    /// How long finished results remain retrievable
    pub result_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            capacity: 64,
            result_ttl: Duration::from_secs(3600),
        }
    }
}

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "result", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Finished(BuildResult),
}

/// Queue errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("build queue is full")]
    Full,
    #[error("build queue is shut down")]
    Closed,
    #[error("job `{0}` not found")]
    NotFound(JobId),
    #[error("job `{0}` did not finish within {1:?}")]
    Timeout(JobId, Duration),
}

struct JobEntry {
    status: JobStatus,
    finished_at: Option<Instant>,
}

type JobTable = Arc<RwLock<HashMap<JobId, JobEntry>>>;
type Intake = mpsc::Receiver<(JobId, BuildJob)>;

pub struct BuildQueue {
    tx: RwLock<Option<mpsc::Sender<(JobId, BuildJob)>>>,
    jobs: JobTable,
    workers: Mutex<Vec<JoinHandle<()>>>,
    orchestrator: Arc<BuildOrchestrator>,
    config: QueueConfig,
}

impl BuildQueue {
    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn new(orchestrator: Arc<BuildOrchestrator>, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let jobs: JobTable = Arc::new(RwLock::new(HashMap::new()));

        let workers = (0..config.workers.max(1))
            .map(|index| tokio::spawn(worker(index, rx.clone(), jobs.clone(), orchestrator.clone())))
            .collect();

        log::info!(
            "Build queue started: {} worker(s), capacity {}",
            config.workers.max(1),
            config.capacity
        );

        Self {
            tx: RwLock::new(Some(tx)),
            jobs,
            workers: Mutex::new(workers),
            orchestrator,
            config,
        }
    }

    /// Accept a job without waiting for it to run.
    pub async fn submit(&self, job: BuildJob) -> Result<JobId, QueueError> {
        self.prune_expired().await;

        let tx = self.tx.read().await;
        let tx = tx.as_ref().ok_or(QueueError::Closed)?;

        let id = Uuid::new_v4();
        let project_id = job.project_id;
        self.jobs.write().await.insert(
            id,
            JobEntry {
                status: JobStatus::Pending,
                finished_at: None,
            },
        );

        match tx.try_send((id, job)) {
            Ok(()) => {
                log::debug!("Queued build {id} for project {project_id}");
                Ok(id)
            }
            Err(e) => {
                self.jobs.write().await.remove(&id);
                match e {
                    TrySendError::Full(_) => {
                        log::warn!("Build queue full; rejected job for project {project_id}");
                        Err(QueueError::Full)
                    }
                    TrySendError::Closed(_) => Err(QueueError::Closed),
                }
            }
        }
    }

    /// Current state of a job; `None` for unknown or expired ids.
    pub async fn status(&self, id: JobId) -> Option<JobStatus> {
        self.jobs.read().await.get(&id).map(|entry| entry.status.clone())
    }

    /// The result of a finished job, if any.
    pub async fn result(&self, id: JobId) -> Option<BuildResult> {
        match self.status(id).await? {
            JobStatus::Finished(result) => Some(result),
            JobStatus::Pending | JobStatus::Running => None,
        }
    }

    /// Block until the job finishes or the timeout elapses.
    pub async fn wait(&self, id: JobId, timeout: Duration) -> Result<BuildResult, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.status(id).await.ok_or(QueueError::NotFound(id))? {
                JobStatus::Finished(result) => return Ok(result),
                JobStatus::Pending | JobStatus::Running => {
                    if Instant::now() >= deadline {
                        return Err(QueueError::Timeout(id, timeout));
                    }
                    sleep(DEFAULT_WAIT_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Forget finished results older than the configured TTL.
    pub async fn prune_expired(&self) -> usize {
        let ttl = self.config.result_ttl;
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| entry.finished_at.is_none_or(|at| at.elapsed() < ttl));
        let pruned = before - jobs.len();
        if pruned > 0 {
            log::debug!("Pruned {pruned} expired build result(s)");
        }
        pruned
    }

    /// Number of tracked jobs (pending, running or finished).
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    pub fn orchestrator(&self) -> &Arc<BuildOrchestrator> {
        &self.orchestrator
    }

    /// Stop accepting jobs, let workers finish what was queued, and wait for them.
    pub async fn shutdown(&self) {
        self.tx.write().await.take();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                log::error!("Build worker failed: {e}");
            }
        }
        log::info!("Build queue stopped");
    }
}

async fn worker(
    index: usize,
    rx: Arc<Mutex<Intake>>,
    jobs: JobTable,
    orchestrator: Arc<BuildOrchestrator>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some((id, job)) = next else {
            break;
        };

        set_status(&jobs, id, JobStatus::Running).await;
        log::debug!("Worker {index} running build {id}");

        let orchestrator = orchestrator.clone();
        let result = match tokio::spawn(async move { orchestrator.run(&job).await }).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Build {id} crashed: {e}");
                BuildResult::error(format!("build worker failed: {e}"))
            }
        };

        set_status(&jobs, id, JobStatus::Finished(result)).await;
    }
    log::debug!("Worker {index} stopped");
}

async fn set_status(jobs: &JobTable, id: JobId, status: JobStatus) {
    let finished_at = matches!(status, JobStatus::Finished(_)).then(Instant::now);
    jobs.write()
        .await
        .insert(id, JobEntry { status, finished_at });
}
