use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::Parser;

use crate::archive::{ArchiveFormat, TimeWindow};
use crate::config::Config;
use crate::parser::ParseMode;
use crate::storage;

#[derive(Parser, Debug)]
#[command(name = "logsieve")]
#[command(version)]
#[command(about = "Run a legacy log parser over an archive, narrowed to a time window", long_about = None)]
#[command(after_help = "Examples:\n  \
  logsieve logs.tar.bz2 errors sessions          run two modes over the whole archive\n  \
  logsieve logs.tgz errors --begin 2024-05-05T00:00:00Z --end 2024-05-05T23:59:59Z\n  \
  logsieve -v https://example.com/upload.zip     list entries of a remote archive")]
pub struct Cli {
    /// Archive path or HTTP URL
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Parse modes to run, in order
    #[arg(value_name = "MODES", required_unless_present_any = ["list", "verbose"])]
    pub modes: Vec<String>,

    /// List archive entries (short format)
    #[arg(short = 'l')]
    pub list: bool,

    /// List entries verbosely with sizes and times
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Window start (RFC 3339)
    #[arg(long, value_name = "TIME", value_parser = parse_time, requires = "end")]
    pub begin: Option<DateTime<Utc>>,

    /// Window end (RFC 3339)
    #[arg(long, value_name = "TIME", value_parser = parse_time, requires = "begin")]
    pub end: Option<DateTime<Utc>>,

    /// Hours added on both sides of the window
    #[arg(long, value_name = "HOURS")]
    pub buffer_hours: Option<i64>,

    /// Minimum size reduction worth rebuilding the archive
    #[arg(long, value_name = "RATIO")]
    pub threshold: Option<f64>,

    /// Timezone handed to the engine
    #[arg(long = "tz", value_name = "TZ", default_value = "UTC")]
    pub timezone: String,

    /// Archive format (tar.bz2, tar.gz, zip); detected when omitted
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<ArchiveFormat>,

    /// Parser engine executable
    #[arg(long, value_name = "PATH")]
    pub engine: Option<PathBuf>,

    /// Per-mode time limit in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write per-mode results into DIR
    #[arg(short = 'd', value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Print the job report as JSON
    #[arg(long)]
    pub json: bool,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    pub fn is_http_url(&self) -> bool {
        storage::is_http_url(&self.archive)
    }

    pub fn is_listing(&self) -> bool {
        self.list || self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || self.json
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    pub fn modes(&self) -> Vec<ParseMode> {
        self.modes.iter().map(|m| ParseMode::new(m.as_str())).collect()
    }

    pub fn window(&self) -> anyhow::Result<Option<TimeWindow>> {
        match (self.begin, self.end) {
            (Some(begin), Some(end)) => TimeWindow::new(begin, end)
                .map(Some)
                .ok_or_else(|| anyhow::anyhow!("--begin {begin} is after --end {end}")),
            _ => Ok(None),
        }
    }

    /// Lay command-line overrides over a loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(hours) = self.buffer_hours {
            config.filter.buffer_hours = hours;
        }
        if let Some(threshold) = self.threshold {
            config.filter.reduction_threshold = threshold;
        }
        if let Some(engine) = &self.engine {
            config.parser.engine = engine.clone();
        }
        if let Some(timeout) = self.timeout {
            config.parser.timeout_secs = timeout;
        }
        if self.is_very_quiet() {
            config.log.level = "error".to_string();
        } else if self.quiet > 0 {
            config.log.level = "warn".to_string();
        }
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|t| t.with_timezone(&Utc))
}
