use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{JobId, ParseJob, SharedJob, TaskOutcome};
use crate::archive::{prefilter, ArchiveFormat, PrefilterOptions, TimeWindow};
use crate::error::{ParseError, ParseErrorKind, RunError};
use crate::parser::{ParseMode, ParseRequest, ParserAdapter};
use crate::sink::{ProgressSink, ProgressUpdate, ResultSink};

/// What a caller asks for: one archive, several modes.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub archive: PathBuf,
    /// Detected from the archive when `None`
    pub format: Option<ArchiveFormat>,
    pub modes: Vec<ParseMode>,
    pub timezone: String,
    pub window: Option<TimeWindow>,
}

/// Runs the modes of a job one after another against a single adapter.
pub struct Orchestrator {
    adapter: Arc<dyn ParserAdapter>,
    results: Arc<dyn ResultSink>,
    progress: Arc<dyn ProgressSink>,
    prefilter: PrefilterOptions,
}

impl Orchestrator {
    pub fn new(
        adapter: Arc<dyn ParserAdapter>,
        results: Arc<dyn ResultSink>,
        progress: Arc<dyn ProgressSink>,
        prefilter: PrefilterOptions,
    ) -> Self {
        Self {
            adapter,
            results,
            progress,
            prefilter,
        }
    }

    pub fn prefilter_options(&self) -> &PrefilterOptions {
        &self.prefilter
    }

    /// Fresh job state for `request`, every task `Pending`.
    pub fn prepare(&self, id: JobId, request: &JobRequest) -> SharedJob {
        Arc::new(Mutex::new(ParseJob::new(
            id,
            request.modes.iter().cloned(),
            request.timezone.clone(),
            request.window,
        )))
    }

    /// Run `request` to completion and return the final job state.
    pub async fn run(&self, request: JobRequest, cancel: CancellationToken) -> ParseJob {
        let job = self.prepare(Uuid::new_v4(), &request);
        self.drive(&job, request, cancel).await;
        job.lock().clone()
    }

    /// Drive an already prepared job until every task is terminal.
    pub async fn drive(&self, job: &SharedJob, request: JobRequest, cancel: CancellationToken) {
        let job_id = job.lock().id;
        info!(
            %job_id,
            archive = %request.archive.display(),
            modes = request.modes.len(),
            "job started"
        );
        if request.modes.is_empty() {
            info!(%job_id, "job has no modes");
            return;
        }

        let outcome = tokio::select! {
            outcome = prefilter(
                &request.archive,
                request.format,
                request.window.as_ref(),
                &self.prefilter,
            ) => Some(outcome),
            _ = cancel.cancelled() => None,
        };
        let Some(outcome) = outcome else {
            self.cancel_rest(job).await;
            info!(%job_id, "job cancelled before parsing");
            return;
        };

        let archive_path = outcome.archive.path().to_path_buf();
        {
            let mut job = job.lock();
            job.archive = Some(archive_path.clone());
            job.filter = Some(outcome.decision.clone());
        }

        for index in 0..request.modes.len() {
            if cancel.is_cancelled() {
                self.cancel_rest(job).await;
                break;
            }

            let mode = request.modes[index].clone();
            let started = job.lock().start_task(index);
            if let Err(err) = started {
                error!(%job_id, %mode, error = %err, "cannot start task");
                self.fail_unstarted(job, index, &mode, &err.to_string()).await;
                continue;
            }
            self.report(job, index);
            debug!(%job_id, %mode, archive = %archive_path.display(), "running mode");

            let parse = ParseRequest {
                archive: archive_path.clone(),
                mode: mode.clone(),
                timezone: request.timezone.clone(),
                window: request.window,
            };
            let result = match self.adapter.run(&parse, &cancel).await {
                Ok(output) => TaskOutcome::Completed(Arc::new(output)),
                Err(RunError::Failed(err)) => {
                    warn!(%job_id, %mode, error = %err, "mode failed");
                    TaskOutcome::Failed(err)
                }
                Err(RunError::Cancelled) => TaskOutcome::Cancelled,
            };
            // Output may win the race against a cancellation, the request
            // still counts for the job.
            if cancel.is_cancelled() {
                job.lock().request_cancel();
            }
            let cancelled = result == TaskOutcome::Cancelled;

            self.finish(job, index, &mode, result).await;
            if cancelled {
                self.cancel_rest(job).await;
                break;
            }
        }

        // Removes the filtered copy, if any.
        drop(outcome.archive);

        let job = job.lock();
        let progress = job.progress();
        info!(
            %job_id,
            status = ?job.status(),
            finished = progress.finished,
            total = progress.total,
            "job finished"
        );
    }

    async fn finish(&self, job: &SharedJob, index: usize, mode: &ParseMode, outcome: TaskOutcome) {
        let job_id = {
            let mut job = job.lock();
            if outcome == TaskOutcome::Cancelled {
                job.request_cancel();
            }
            if let Err(err) = job.finish_task(index, outcome.clone()) {
                error!(job_id = %job.id, %mode, error = %err, "cannot finish task");
                return;
            }
            job.id
        };
        self.report(job, index);

        if let Err(err) = self.results.accept(job_id, mode, &outcome).await {
            warn!(%job_id, %mode, error = %err, "result sink rejected outcome");
        }
    }

    /// A task that could not be started is failed in place.
    async fn fail_unstarted(&self, job: &SharedJob, index: usize, mode: &ParseMode, reason: &str) {
        let error = ParseError::new(
            ParseErrorKind::ProcessSpawnFailed,
            format!("cannot start mode: {reason}"),
        );
        let job_id = {
            let mut job = job.lock();
            if !job.fail_unstarted(index, error.clone()) {
                return;
            }
            job.id
        };
        self.report(job, index);

        let outcome = TaskOutcome::Failed(error);
        if let Err(err) = self.results.accept(job_id, mode, &outcome).await {
            warn!(%job_id, %mode, error = %err, "result sink rejected outcome");
        }
    }

    /// Observe a cancellation request: every task still pending is
    /// cancelled without running.
    async fn cancel_rest(&self, job: &SharedJob) {
        let (job_id, cancelled) = {
            let mut job = job.lock();
            job.request_cancel();
            let cancelled: Vec<_> = job
                .cancel_pending()
                .into_iter()
                .map(|index| (index, job.tasks[index].mode.clone()))
                .collect();
            (job.id, cancelled)
        };

        for (index, mode) in cancelled {
            self.report(job, index);
            if let Err(err) = self
                .results
                .accept(job_id, &mode, &TaskOutcome::Cancelled)
                .await
            {
                warn!(%job_id, %mode, error = %err, "result sink rejected outcome");
            }
        }
    }

    fn report(&self, job: &SharedJob, index: usize) {
        let update = {
            let job = job.lock();
            ProgressUpdate {
                job_id: job.id,
                task_index: index,
                mode: job.tasks[index].mode.clone(),
                state: job.tasks[index].state,
                progress: job.progress(),
            }
        };
        self.progress.report(update);
    }
}
