//! Boundary to the legacy parsing engine.
//!
//! The engine is opaque: it receives an archive, a mode, a timezone and an
//! optional window, and prints text or CSV. [`ParserAdapter`] is the seam
//! the orchestrator runs against; [`ProcessParser`] drives the real
//! executable.

mod process;

pub use process::{ProcessParser, ProcessParserConfig};

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::archive::TimeWindow;
use crate::error::RunError;

/// Name of an analysis the engine performs, e.g. `errors` or `bandwidth`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParseMode(String);

impl ParseMode {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ParseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParseMode {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// One engine invocation.
#[derive(Debug, Clone)]
pub struct ParseRequest {
    pub archive: PathBuf,
    pub mode: ParseMode,
    pub timezone: String,
    pub window: Option<TimeWindow>,
}

/// Opaque engine output for one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl RawOutput {
    pub fn from_text(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            elapsed: Duration::ZERO,
        }
    }
}

/// Runs one mode of the engine.
///
/// Implementations must stop promptly once `cancel` fires and answer
/// [`RunError::Cancelled`]. Output already fully captured when the
/// cancellation is observed should still be returned as `Ok`.
#[async_trait]
pub trait ParserAdapter: Send + Sync {
    async fn run(
        &self,
        request: &ParseRequest,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, RunError>;
}

pub(crate) mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
