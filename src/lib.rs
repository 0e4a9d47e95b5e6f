//! # logsieve
//!
//! Runs a legacy log-parsing engine over uploaded log archives, one parse
//! mode at a time.
//!
//! When the caller asks for a time window, the archive is first narrowed:
//! its entries are listed without extraction, the ones modified outside
//! the buffered window are dropped and, if that saves enough, a smaller
//! archive is rebuilt in a temporary file. Any problem along the way falls
//! back to the original upload.
//!
//! ## Features
//!
//! - tar.bz2, tar.gz and zip archives, with `lbzip2`/`pbzip2`/`pigz` used
//!   when available
//! - Sequential per-mode execution with progress, timeouts and
//!   cooperative cancellation
//! - Bounded concurrency across jobs
//! - Local paths and HTTP(S) downloads as archive sources
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use logsieve::archive::PrefilterOptions;
//! use logsieve::job::{JobRequest, Orchestrator};
//! use logsieve::sink::{MemoryResultSink, NullProgressSink};
//! use logsieve::{ProcessParser, ProcessParserConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let parser = ProcessParser::new(ProcessParserConfig {
//!         engine: "legacy-parser".into(),
//!         extra_args: Vec::new(),
//!         timeout: Duration::from_secs(1800),
//!     });
//!     let orchestrator = Orchestrator::new(
//!         Arc::new(parser),
//!         Arc::new(MemoryResultSink::new()),
//!         Arc::new(NullProgressSink),
//!         PrefilterOptions::default(),
//!     );
//!
//!     let job = orchestrator
//!         .run(
//!             JobRequest {
//!                 archive: "upload.tar.bz2".into(),
//!                 format: None,
//!                 modes: vec!["errors".into(), "sessions".into()],
//!                 timezone: "UTC".to_string(),
//!                 window: None,
//!             },
//!             CancellationToken::new(),
//!         )
//!         .await;
//!     println!("{:?}", job.status());
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod io;
pub mod job;
pub mod logging;
pub mod parser;
pub mod sink;
pub mod storage;
pub mod zip;

pub use archive::{ArchiveEntry, ArchiveFormat, FilterDecision, TimeWindow};
pub use cli::Cli;
pub use config::Config;
pub use error::{FilterError, ParseError, ParseErrorKind, RunError};
pub use io::{LocalFileReader, ReadAt};
pub use job::{JobPool, Orchestrator, ParseJob};
pub use parser::{ParseMode, ParserAdapter, ProcessParser, ProcessParserConfig};
pub use zip::{ZipFileEntry, ZipParser};
