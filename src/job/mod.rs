//! Parse jobs: the per-upload task state machine, its orchestrator and the
//! bounded job pool.
//!
//! A [`ParseJob`] is the single authoritative record of a job's progress.
//! It lives behind a [`SharedJob`] mutex, mutated only by the
//! orchestrator and read by everyone else through snapshots.

mod orchestrator;
mod pool;

pub use orchestrator::{JobRequest, Orchestrator};
pub use pool::{
    JobHandle, JobPool, PoolOptions, DEFAULT_MAX_CONCURRENT_JOBS, DEFAULT_STALE_AFTER,
};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::archive::{FilterDecision, TimeWindow};
use crate::error::{JobStateError, ParseError};
use crate::parser::{ParseMode, RawOutput};

pub type JobId = Uuid;

/// Job state shared between its worker and its handles.
pub type SharedJob = Arc<Mutex<ParseJob>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Arc<RawOutput>),
    Failed(ParseError),
    Cancelled,
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParseTask {
    pub mode: ParseMode,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed: Option<Duration>,
    pub output: Option<Arc<RawOutput>>,
    pub error: Option<ParseError>,
}

impl ParseTask {
    fn new(mode: ParseMode) -> Self {
        Self {
            mode,
            state: TaskState::Pending,
            started_at: None,
            finished_at: None,
            elapsed: None,
            output: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Cancelled,
}

/// `(finished, total, current_mode)`; `finished` counts completed and
/// failed tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub finished: usize,
    pub total: usize,
    pub current_mode: Option<ParseMode>,
}

#[derive(Debug, Clone)]
pub struct ParseJob {
    pub id: JobId,
    pub tasks: Vec<ParseTask>,
    pub current: Option<usize>,
    pub archive: Option<PathBuf>,
    pub window: Option<TimeWindow>,
    pub timezone: String,
    pub filter: Option<FilterDecision>,
    cancel_requested: bool,
}

impl ParseJob {
    pub fn new(
        id: JobId,
        modes: impl IntoIterator<Item = ParseMode>,
        timezone: impl Into<String>,
        window: Option<TimeWindow>,
    ) -> Self {
        Self {
            id,
            tasks: modes.into_iter().map(ParseTask::new).collect(),
            current: None,
            archive: None,
            window,
            timezone: timezone.into(),
            filter: None,
            cancel_requested: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.state.is_terminal())
    }

    /// Derived from the tasks and whether cancellation was ever
    /// requested.
    pub fn status(&self) -> JobStatus {
        if !self.is_finished() {
            JobStatus::Running
        } else if self.cancel_requested {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn progress(&self) -> Progress {
        Progress {
            finished: self
                .tasks
                .iter()
                .filter(|t| matches!(t.state, TaskState::Completed | TaskState::Failed))
                .count(),
            total: self.tasks.len(),
            current_mode: self.current.map(|i| self.tasks[i].mode.clone()),
        }
    }

    pub fn running_task(&self) -> Option<usize> {
        self.tasks.iter().position(|t| t.state == TaskState::Running)
    }

    /// `Pending -> Running`, allowed only while no other task runs.
    pub fn start_task(&mut self, index: usize) -> Result<(), JobStateError> {
        if let Some(running) = self.running_task() {
            return Err(JobStateError::AlreadyRunning { running });
        }
        let task = self
            .tasks
            .get_mut(index)
            .ok_or(JobStateError::NoSuchTask(index))?;
        if task.state != TaskState::Pending {
            return Err(JobStateError::InvalidTransition {
                index,
                from: task.state.as_str(),
                to: TaskState::Running.as_str(),
            });
        }

        task.state = TaskState::Running;
        task.started_at = Some(Utc::now());
        self.current = Some(index);
        Ok(())
    }

    /// `Running -> Completed | Failed | Cancelled`.
    pub fn finish_task(&mut self, index: usize, outcome: TaskOutcome) -> Result<(), JobStateError> {
        let task = self
            .tasks
            .get_mut(index)
            .ok_or(JobStateError::NoSuchTask(index))?;
        if task.state != TaskState::Running {
            return Err(JobStateError::InvalidTransition {
                index,
                from: task.state.as_str(),
                to: outcome.state().as_str(),
            });
        }

        let now = Utc::now();
        task.state = outcome.state();
        task.finished_at = Some(now);
        task.elapsed = task
            .started_at
            .and_then(|started| (now - started).to_std().ok());
        match outcome {
            TaskOutcome::Completed(output) => task.output = Some(output),
            TaskOutcome::Failed(error) => task.error = Some(error),
            TaskOutcome::Cancelled => {}
        }
        self.current = None;
        Ok(())
    }

    /// Record a cancellation request. A finished job ignores it and
    /// `false` is returned.
    pub fn request_cancel(&mut self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    /// `Pending -> Failed` for a task that could not be started. `false`
    /// when the task is missing or not pending.
    pub fn fail_unstarted(&mut self, index: usize, error: ParseError) -> bool {
        let Some(task) = self.tasks.get_mut(index) else {
            return false;
        };
        if task.state != TaskState::Pending {
            return false;
        }
        task.state = TaskState::Failed;
        task.finished_at = Some(Utc::now());
        task.error = Some(error);
        true
    }

    /// `Pending -> Cancelled` for every task that never started; returns
    /// their indices.
    pub fn cancel_pending(&mut self) -> Vec<usize> {
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for (index, task) in self.tasks.iter_mut().enumerate() {
            if task.state == TaskState::Pending {
                task.state = TaskState::Cancelled;
                task.finished_at = Some(now);
                cancelled.push(index);
            }
        }
        cancelled
    }

    /// Fail every non-terminal task, used when a worker dies.
    pub fn abort_remaining(&mut self, message: &str) -> Vec<usize> {
        let now = Utc::now();
        let mut aborted = Vec::new();
        for (index, task) in self.tasks.iter_mut().enumerate() {
            if !task.state.is_terminal() {
                task.state = TaskState::Failed;
                task.finished_at = Some(now);
                task.error = Some(ParseError::new(
                    crate::error::ParseErrorKind::ProcessSpawnFailed,
                    message,
                ));
                aborted.push(index);
            }
        }
        self.current = None;
        aborted
    }

    pub fn report(&self) -> JobReport {
        JobReport {
            id: self.id,
            status: self.status(),
            archive: self.archive.clone(),
            timezone: self.timezone.clone(),
            window: self.window,
            filter: self.filter.clone(),
            tasks: self
                .tasks
                .iter()
                .map(|t| TaskReport {
                    mode: t.mode.clone(),
                    state: t.state,
                    started_at: t.started_at,
                    finished_at: t.finished_at,
                    elapsed_ms: t.elapsed.map(|d| d.as_millis() as u64),
                    output_bytes: t.output.as_ref().map(|o| o.stdout.len()),
                    error: t.error.clone(),
                })
                .collect(),
        }
    }
}

/// Final per-mode breakdown of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: JobId,
    pub status: JobStatus,
    pub archive: Option<PathBuf>,
    pub timezone: String,
    pub window: Option<TimeWindow>,
    pub filter: Option<FilterDecision>,
    pub tasks: Vec<TaskReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub mode: ParseMode,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
    pub output_bytes: Option<usize>,
    pub error: Option<ParseError>,
}
