//! Where task results and progress updates go.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::job::{JobId, Progress, TaskOutcome, TaskState};
use crate::parser::ParseMode;

/// Receives every terminal task transition exactly once, before the next
/// task of the same job starts.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn accept(&self, job_id: JobId, mode: &ParseMode, outcome: &TaskOutcome)
        -> anyhow::Result<()>;
}

/// One task state change.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub task_index: usize,
    pub mode: ParseMode,
    pub state: TaskState,
    pub progress: Progress,
}

/// Push-side progress reporting. Must not block: the orchestrator calls
/// it while holding no locks but in the middle of a job.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

/// Keeps results in memory, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    results: Mutex<Vec<(JobId, ParseMode, TaskOutcome)>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_job(&self, job_id: JobId) -> Vec<(ParseMode, TaskOutcome)> {
        self.results
            .lock()
            .iter()
            .filter(|(id, _, _)| *id == job_id)
            .map(|(_, mode, outcome)| (mode.clone(), outcome.clone()))
            .collect()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn accept(
        &self,
        job_id: JobId,
        mode: &ParseMode,
        outcome: &TaskOutcome,
    ) -> anyhow::Result<()> {
        self.results
            .lock()
            .push((job_id, mode.clone(), outcome.clone()));
        Ok(())
    }
}

/// Writes `<root>/<job_id>/<mode>.out` for completed tasks and
/// `<mode>.err` for failed ones. Cancelled tasks leave no file.
#[derive(Debug, Clone)]
pub struct DirectoryResultSink {
    root: PathBuf,
}

impl DirectoryResultSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }
}

#[async_trait]
impl ResultSink for DirectoryResultSink {
    async fn accept(
        &self,
        job_id: JobId,
        mode: &ParseMode,
        outcome: &TaskOutcome,
    ) -> anyhow::Result<()> {
        let (extension, contents) = match outcome {
            TaskOutcome::Completed(output) => ("out", output.stdout.clone()),
            TaskOutcome::Failed(error) => ("err", format!("{error}\n")),
            TaskOutcome::Cancelled => {
                debug!(%job_id, %mode, "cancelled, nothing written");
                return Ok(());
            }
        };

        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let path = dir.join(format!("{}.{}", file_stem(mode), extension));
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("Failed to write result: {}", path.display()))?;
        debug!(%job_id, %mode, path = %path.display(), "result written");
        Ok(())
    }
}

/// Mode names become file names; anything outside `[A-Za-z0-9._-]` is
/// replaced.
fn file_stem(mode: &ParseMode) -> String {
    let stem: String = mode
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match stem.trim_matches('.') {
        "" => "_".to_string(),
        _ => stem,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn report(&self, _update: ProgressUpdate) {}
}

/// Logs every update at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn report(&self, update: ProgressUpdate) {
        info!(
            job_id = %update.job_id,
            task = update.task_index,
            mode = %update.mode,
            state = %update.state,
            finished = update.progress.finished,
            total = update.progress.total,
            "task state changed"
        );
    }
}

/// Forwards updates into a bounded channel; drops them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    sender: mpsc::Sender<ProgressUpdate>,
}

impl ChannelProgressSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn report(&self, update: ProgressUpdate) {
        if let Err(err) = self.sender.try_send(update) {
            debug!(error = %err, "progress update dropped");
        }
    }
}
