use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{JobId, JobRequest, Orchestrator, ParseJob, Progress, SharedJob};
use crate::archive::sweep_stale;

/// Default number of jobs allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 2;

/// Default age past which a leftover filtered archive is swept. Far
/// longer than any job holds its archive.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_concurrent_jobs: usize,
    /// Filtered archives older than this are removed when the pool starts
    pub stale_after: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// Caller's view of a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    job: SharedJob,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Copy of the current job state.
    pub fn snapshot(&self) -> ParseJob {
        self.job.lock().clone()
    }

    pub fn progress(&self) -> Progress {
        self.job.lock().progress()
    }

    /// Request cooperative cancellation. Returns `false` when the job had
    /// already finished.
    pub fn cancel(&self) -> bool {
        let mut job = self.job.lock();
        if !job.request_cancel() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Wait until every task is terminal and return the final state.
    pub async fn wait(&self) -> ParseJob {
        let mut done = self.done.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            warn!(job_id = %self.id, "job worker vanished");
        }
        self.snapshot()
    }
}

/// Runs jobs on the tokio runtime, at most `max_concurrent_jobs` at a
/// time.
pub struct JobPool {
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    jobs: DashMap<JobId, JobHandle>,
}

impl JobPool {
    /// Create a pool and clear filtered archives left by a previous run.
    pub fn new(orchestrator: Orchestrator, options: PoolOptions) -> Self {
        let temp_dir = &orchestrator.prefilter_options().rebuild.temp_dir;
        match sweep_stale(temp_dir, options.stale_after) {
            Ok(removed) => debug!(dir = %temp_dir.display(), removed, "temp dir swept"),
            Err(err) => warn!(dir = %temp_dir.display(), error = %err, "cannot sweep temp dir"),
        }

        Self {
            orchestrator: Arc::new(orchestrator),
            permits: Arc::new(Semaphore::new(options.max_concurrent_jobs.max(1))),
            jobs: DashMap::new(),
        }
    }

    pub fn submit(&self, request: JobRequest) -> JobHandle {
        let id = Uuid::new_v4();
        let job = self.orchestrator.prepare(id, &request);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        let handle = JobHandle {
            id,
            job: job.clone(),
            cancel: cancel.clone(),
            done: done_rx,
        };
        self.jobs.insert(id, handle.clone());

        let orchestrator = self.orchestrator.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // A job cancelled while queued runs without a permit and
            // cancels all of its tasks straight away.
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            debug!(job_id = %id, queued = permit.is_none(), "job admitted");

            let worker = {
                let job = job.clone();
                tokio::spawn(async move { orchestrator.drive(&job, request, cancel).await })
            };
            if let Err(err) = worker.await {
                error!(job_id = %id, error = %err, "job worker died");
                let aborted = job.lock().abort_remaining(&format!("job worker died: {err}"));
                info!(job_id = %id, aborted = aborted.len(), "remaining tasks failed");
            }

            drop(permit);
            let _ = done_tx.send(true);
        });

        handle
    }

    pub fn get(&self, id: JobId) -> Option<JobHandle> {
        self.jobs.get(&id).map(|entry| entry.value().clone())
    }

    /// `false` when the job is unknown or already finished.
    pub fn cancel(&self, id: JobId) -> bool {
        self.get(id).is_some_and(|handle| handle.cancel())
    }

    pub fn snapshot(&self, id: JobId) -> Option<ParseJob> {
        self.get(id).map(|handle| handle.snapshot())
    }

    pub fn progress(&self, id: JobId) -> Option<Progress> {
        self.get(id).map(|handle| handle.progress())
    }

    /// Forget a finished job. Running jobs stay registered.
    pub fn clear(&self, id: JobId) -> Option<ParseJob> {
        self.jobs
            .remove_if(&id, |_, handle| handle.job.lock().is_finished())
            .map(|(_, handle)| handle.snapshot())
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }
}
