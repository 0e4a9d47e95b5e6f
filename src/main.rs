//! Main entry point for the logsieve CLI application.
//!
//! Resolves the archive, optionally lists it, and otherwise runs the
//! requested parse modes as a single job.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use logsieve::archive::{inspect, ArchiveEntry, ArchiveFormat};
use logsieve::job::{JobPool, JobRequest, JobStatus, Orchestrator, ParseJob, TaskState};
use logsieve::sink::{
    DirectoryResultSink, MemoryResultSink, NullProgressSink, ProgressSink, ResultSink,
    TracingProgressSink,
};
use logsieve::storage::{DefaultResolver, StorageResolver};
use logsieve::{logging, Cli, Config, ProcessParser};

/// Application entry point.
///
/// The exit code is non-zero when any mode failed or the job was
/// cancelled.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;
    logging::init(&config.log)?;
    if let Some(path) = Config::resolve_path(cli.config.as_deref()) {
        info!(path = %path.display(), "configuration loaded");
    }

    let resolver = DefaultResolver::new(&config.temp_dir)?;
    let archive = resolver.resolve(&cli.archive).await?;
    if cli.is_http_url() && !cli.is_quiet() {
        eprintln!(
            "Total bytes transferred: {}",
            format_size(resolver.transferred_bytes())
        );
    }

    if cli.is_listing() {
        let format = match cli.format {
            Some(format) => format,
            None => ArchiveFormat::detect(archive.path())?,
        };
        let entries = inspect(archive.path(), format, config.filter.prefer_parallel_codec).await?;
        list_entries(&entries, cli.verbose);
        return Ok(ExitCode::SUCCESS);
    }

    let results: Arc<dyn ResultSink> = match &cli.output_dir {
        Some(dir) => Arc::new(DirectoryResultSink::new(dir)),
        None => Arc::new(MemoryResultSink::new()),
    };
    let progress: Arc<dyn ProgressSink> = if cli.is_quiet() {
        Arc::new(NullProgressSink)
    } else {
        Arc::new(TracingProgressSink)
    };
    let orchestrator = Orchestrator::new(
        Arc::new(ProcessParser::new(config.parser_config())),
        results,
        progress,
        config.prefilter_options(),
    );
    let pool = JobPool::new(orchestrator, config.pool_options());

    let handle = pool.submit(JobRequest {
        archive: archive.path().to_path_buf(),
        format: cli.format,
        modes: cli.modes(),
        timezone: cli.timezone.clone(),
        window: cli.window()?,
    });

    let job = tokio::select! {
        job = handle.wait() => job,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %handle.id(), "interrupted, cancelling job");
            handle.cancel();
            handle.wait().await
        }
    };
    drop(archive);

    if cli.json {
        let report = serde_json::to_string_pretty(&job.report())
            .context("Failed to serialize job report")?;
        println!("{report}");
    } else {
        if cli.output_dir.is_none() {
            print_outputs(&job);
        }
        if !cli.is_very_quiet() {
            print_summary(&job);
        }
    }

    let failed = job.tasks.iter().any(|t| t.state == TaskState::Failed);
    if failed || job.status() == JobStatus::Cancelled {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// List archive entries.
///
/// Supports two output formats:
/// - Simple format (`-l`): Just entry names, one per line
/// - Verbose format (`-v`): Table with size, modification time and totals
fn list_entries(entries: &[ArchiveEntry], verbose: bool) {
    if !verbose {
        for entry in entries {
            println!("{}", entry.path);
        }
        return;
    }

    println!("{:>10}  {:>10}  {:>5}  Name", "Length", "Date", "Time");
    println!("{}", "-".repeat(70));

    let mut total = 0u64;
    for entry in entries {
        println!(
            "{:>10}  {}  {}",
            entry.size,
            entry.modified.format("%Y-%m-%d  %H:%M"),
            entry.path
        );
        total += entry.size;
    }

    println!("{}", "-".repeat(70));
    println!("{:>10}  {:>17}  {} files", total, "", entries.len());
}

/// Print each completed mode's output, marked with its name when there
/// is more than one mode.
fn print_outputs(job: &ParseJob) {
    let marked = job.tasks.len() > 1;
    for task in &job.tasks {
        let Some(output) = &task.output else {
            continue;
        };
        if marked {
            println!("--- {} ---", task.mode);
        }
        print!("{}", output.stdout);
        if !output.stdout.is_empty() && !output.stdout.ends_with('\n') {
            println!();
        }
    }
}

/// Per-mode status table on stderr, followed by the filter decision.
fn print_summary(job: &ParseJob) {
    eprintln!();
    for task in &job.tasks {
        let elapsed = task
            .elapsed
            .map(|d| format!("{:.2}s", d.as_secs_f64()))
            .unwrap_or_else(|| "-".to_string());
        let detail = match (&task.output, &task.error) {
            (Some(output), _) => format_size(output.stdout.len() as u64),
            (None, Some(error)) => error.to_string(),
            (None, None) => String::new(),
        };
        eprintln!(
            "  {:<16}  {:<9}  {:>8}  {}",
            task.mode.as_str(),
            task.state.as_str(),
            elapsed,
            detail
        );
    }

    if let Some(decision) = &job.filter {
        if decision.applied {
            eprintln!(
                "filter: applied, {} of {} entries kept, {} -> {} ({:.1}% smaller)",
                decision.filtered_entries,
                decision.source_entries,
                format_size(decision.source_size),
                format_size(decision.filtered_size),
                decision.reduction * 100.0
            );
        } else if let Some(reason) = decision.fallback_reason {
            eprintln!("filter: not applied ({reason:?})");
        }
    }
    eprintln!("job {}: {:?}", job.id, job.status());
}

/// Format a byte size into a human-readable string.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
