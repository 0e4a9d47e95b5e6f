use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ParseRequest, ParserAdapter, RawOutput};
use crate::error::{ParseError, ParseErrorKind, RunError};

/// How long output pipes may stay open after the engine exited.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Characters of stderr quoted in a failure message.
const STDERR_TAIL: usize = 512;

#[derive(Debug, Clone)]
pub struct ProcessParserConfig {
    /// Engine executable
    pub engine: PathBuf,
    /// Arguments placed before the request flags
    pub extra_args: Vec<String>,
    /// Wall-clock limit per mode
    pub timeout: Duration,
}

/// Runs the legacy engine as a child process, one mode per call.
///
/// Command line:
/// `<engine> <extra_args..> --archive <path> --mode <mode> --timezone <tz>
/// [--begin <rfc3339> --end <rfc3339>]`
pub struct ProcessParser {
    config: ProcessParserConfig,
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

impl ProcessParser {
    pub fn new(config: ProcessParserConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &ParseRequest) -> Command {
        let mut cmd = Command::new(&self.config.engine);
        cmd.args(&self.config.extra_args)
            .arg("--archive")
            .arg(&request.archive)
            .arg("--mode")
            .arg(request.mode.as_str())
            .arg("--timezone")
            .arg(&request.timezone);

        if let Some(window) = &request.window {
            cmd.arg("--begin")
                .arg(window.begin().to_rfc3339())
                .arg("--end")
                .arg(window.end().to_rfc3339());
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ParserAdapter for ProcessParser {
    async fn run(
        &self,
        request: &ParseRequest,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let started = Instant::now();
        let mut child = self.command(request).spawn().map_err(|e| {
            ParseError::new(
                ParseErrorKind::ProcessSpawnFailed,
                format!("{}: {}", self.config.engine.display(), e),
            )
        })?;
        debug!(mode = %request.mode, pid = child.id(), "engine started");

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        // Completion is polled first: a process that already exited wins
        // over a cancellation arriving at the same time.
        let exit = tokio::select! {
            biased;
            status = child.wait() => Exit::Status(status),
            _ = cancel.cancelled() => Exit::Cancelled,
            _ = tokio::time::sleep(self.config.timeout) => Exit::TimedOut,
        };

        let status = match exit {
            Exit::Status(status) => status.map_err(|e| {
                ParseError::new(ParseErrorKind::NonZeroExit, format!("wait failed: {e}"))
            })?,
            Exit::Cancelled => {
                terminate(&mut child, &request.mode).await;
                stdout.abort();
                stderr.abort();
                return Err(RunError::Cancelled);
            }
            Exit::TimedOut => {
                terminate(&mut child, &request.mode).await;
                stdout.abort();
                stderr.abort();
                return Err(ParseError::new(
                    ParseErrorKind::Timeout,
                    format!("no result after {:?}", self.config.timeout),
                )
                .into());
            }
        };

        let stdout = drain(stdout).await?;
        let stderr = String::from_utf8_lossy(&drain(stderr).await?).into_owned();

        if !status.success() {
            let reason = match status.code() {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            };
            return Err(ParseError::new(
                ParseErrorKind::NonZeroExit,
                format!("{reason}: {}", tail(&stderr)),
            )
            .into());
        }

        let stdout = String::from_utf8(stdout).map_err(|e| {
            ParseError::new(
                ParseErrorKind::MalformedOutput,
                format!("output is not UTF-8 text: {e}"),
            )
        })?;

        Ok(RawOutput {
            stdout,
            stderr,
            exit_code: status.code(),
            elapsed: started.elapsed(),
        })
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok(buf)
    })
}

async fn drain(reader: JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>, ParseError> {
    let malformed = |msg: String| ParseError::new(ParseErrorKind::MalformedOutput, msg);
    match tokio::time::timeout(PIPE_DRAIN_GRACE, reader).await {
        Ok(Ok(Ok(buf))) => Ok(buf),
        Ok(Ok(Err(e))) => Err(malformed(format!("cannot read engine output: {e}"))),
        Ok(Err(e)) => Err(malformed(format!("output reader failed: {e}"))),
        Err(_) => Err(malformed("output pipe left open after exit".to_string())),
    }
}

async fn terminate(child: &mut Child, mode: &super::ParseMode) {
    if let Err(err) = child.start_kill() {
        warn!(%mode, error = %err, "cannot signal engine");
        return;
    }
    if let Err(err) = child.wait().await {
        warn!(%mode, error = %err, "engine did not exit after kill");
    }
}

fn tail(text: &str) -> &str {
    let text = text.trim();
    match text.char_indices().rev().nth(STDERR_TAIL.saturating_sub(1)) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::parser::ParseMode;

    fn shell(script: &str, timeout: Duration) -> ProcessParser {
        ProcessParser::new(ProcessParserConfig {
            engine: PathBuf::from("/bin/sh"),
            extra_args: vec!["-c".to_string(), script.to_string(), "engine".to_string()],
            timeout,
        })
    }

    fn request(mode: &str) -> ParseRequest {
        ParseRequest {
            archive: PathBuf::from("/data/upload.tar.bz2"),
            mode: ParseMode::new(mode),
            timezone: "Europe/Berlin".to_string(),
            window: None,
        }
    }

    #[tokio::test]
    async fn passes_request_flags_and_captures_stdout() {
        let parser = shell("echo \"$@\"", Duration::from_secs(10));
        let output = parser
            .run(&request("errors"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            output.stdout.trim(),
            "--archive /data/upload.tar.bz2 --mode errors --timezone Europe/Berlin"
        );
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let parser = shell("echo 'bad mode' >&2; exit 3", Duration::from_secs(10));
        let err = parser
            .run(&request("nope"), &CancellationToken::new())
            .await
            .unwrap_err();
        let err = match err {
            RunError::Failed(err) => err,
            other => panic!("expected failure, got {other:?}"),
        };
        assert_eq!(err.kind, ParseErrorKind::NonZeroExit);
        assert!(err.message.contains("exit code 3"));
        assert!(err.message.contains("bad mode"));
    }

    #[tokio::test]
    async fn slow_engine_times_out() {
        let parser = shell("exec sleep 30", Duration::from_millis(200));
        let started = Instant::now();
        let err = parser
            .run(&request("sessions"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Failed(ref e) if e.kind == ParseErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_kills_the_engine() {
        let parser = shell("exec sleep 30", Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = parser.run(&request("bandwidth"), &cancel).await.unwrap_err();
        assert_eq!(err, RunError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_engine_is_a_spawn_failure() {
        let parser = ProcessParser::new(ProcessParserConfig {
            engine: PathBuf::from("/nonexistent/legacy-parser"),
            extra_args: Vec::new(),
            timeout: Duration::from_secs(1),
        });
        let err = parser
            .run(&request("errors"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, RunError::Failed(ref e) if e.kind == ParseErrorKind::ProcessSpawnFailed)
        );
    }

    #[tokio::test]
    async fn binary_output_is_malformed() {
        let parser = shell("printf '\\377\\376'", Duration::from_secs(10));
        let err = parser
            .run(&request("errors"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, RunError::Failed(ref e) if e.kind == ParseErrorKind::MalformedOutput)
        );
    }

    #[test]
    fn tail_keeps_the_end() {
        let long = "x".repeat(STDERR_TAIL) + "END";
        assert!(tail(&long).ends_with("END"));
        assert_eq!(tail(&long).chars().count(), STDERR_TAIL);
        assert_eq!(tail("  short \n"), "short");
    }
}
