//! Error taxonomy shared by the pre-filter, the parser adapter and the
//! job orchestrator.
//!
//! Filter errors are always recoverable: the caller falls back to the
//! unfiltered archive. Parse errors are recorded against a single task and
//! never unwind the job.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure while inspecting, filtering or rebuilding an archive.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("rebuild failed: {0}")]
    RebuildFailed(String),
}

impl From<std::io::Error> for FilterError {
    fn from(err: std::io::Error) -> Self {
        FilterError::RebuildFailed(err.to_string())
    }
}

/// Category of a parse failure reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    NonZeroExit,
    Timeout,
    MalformedOutput,
    ProcessSpawnFailed,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParseErrorKind::NonZeroExit => "non-zero exit",
            ParseErrorKind::Timeout => "timeout",
            ParseErrorKind::MalformedOutput => "malformed output",
            ParseErrorKind::ProcessSpawnFailed => "process spawn failed",
        };
        f.write_str(name)
    }
}

/// Structured failure of a single parse mode.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of an adapter call that did not produce output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error(transparent)]
    Failed(#[from] ParseError),

    /// The call observed a cancellation request and stopped the engine.
    #[error("cancelled")]
    Cancelled,
}

/// Illegal task state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStateError {
    #[error("task index {0} out of range")]
    NoSuchTask(usize),

    #[error("task {index} cannot move from {from} to {to}")]
    InvalidTransition {
        index: usize,
        from: &'static str,
        to: &'static str,
    },

    #[error("task {running} is still running")]
    AlreadyRunning { running: usize },
}

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
