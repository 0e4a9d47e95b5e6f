//! Inspect, decide, rebuild: never fails, only falls back.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::filter::{decide, FallbackReason, FilterDecision, FilterPolicy, TimeWindow};
use super::inspect::inspect;
use super::rebuild::{rebuild, FilteredArchive, RebuildOptions};
use super::ArchiveFormat;
use crate::error::FilterError;

#[derive(Debug, Clone, Default)]
pub struct PrefilterOptions {
    pub policy: FilterPolicy,
    pub rebuild: RebuildOptions,
}

/// The archive handed to the parser: the upload itself or a rebuilt copy.
#[derive(Debug)]
pub enum ResolvedArchive {
    Original(PathBuf),
    Filtered(FilteredArchive),
}

impl ResolvedArchive {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedArchive::Original(path) => path,
            ResolvedArchive::Filtered(archive) => archive.path(),
        }
    }

    pub fn is_filtered(&self) -> bool {
        matches!(self, ResolvedArchive::Filtered(_))
    }
}

#[derive(Debug)]
pub struct PrefilterOutcome {
    pub decision: FilterDecision,
    pub archive: ResolvedArchive,
}

impl PrefilterOutcome {
    fn original(path: &Path, decision: FilterDecision) -> Self {
        Self {
            decision,
            archive: ResolvedArchive::Original(path.to_path_buf()),
        }
    }
}

/// Narrow `path` to `window` when that is worthwhile.
///
/// Pre-filtering is an optimization only: every error is logged and
/// answered with the original archive and a fallback reason.
pub async fn prefilter(
    path: &Path,
    format: Option<ArchiveFormat>,
    window: Option<&TimeWindow>,
    options: &PrefilterOptions,
) -> PrefilterOutcome {
    let Some(window) = window else {
        return PrefilterOutcome::original(path, FilterDecision::skipped());
    };

    let format = match format.map_or_else(|| ArchiveFormat::detect(path), Ok) {
        Ok(format) => format,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot filter archive, using original");
            return PrefilterOutcome::original(path, FilterDecision::failed(reason_for(&err)));
        }
    };

    let entries = match inspect(path, format, options.rebuild.prefer_parallel).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot inspect archive, using original");
            return PrefilterOutcome::original(path, FilterDecision::failed(reason_for(&err)));
        }
    };

    let selection = decide(&entries, Some(window), &options.policy);
    if !selection.should_rebuild() {
        info!(
            path = %path.display(),
            reduction = selection.decision.reduction,
            reason = ?selection.decision.fallback_reason,
            "filter not applied"
        );
        return PrefilterOutcome::original(path, selection.decision);
    }

    match rebuild(path, format, &selection.selected, &options.rebuild).await {
        Ok(filtered) => {
            info!(
                path = %path.display(),
                filtered = %filtered.path().display(),
                format = ?filtered.format(),
                entries = filtered.entries(),
                size = filtered.size(),
                reduction = selection.decision.reduction,
                "filter applied"
            );
            PrefilterOutcome {
                decision: selection.decision,
                archive: ResolvedArchive::Filtered(filtered),
            }
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "rebuild failed, using original");
            PrefilterOutcome::original(
                path,
                selection.decision.with_fallback(FallbackReason::RebuildFailed),
            )
        }
    }
}

fn reason_for(err: &FilterError) -> FallbackReason {
    match err {
        FilterError::UnsupportedFormat(_) => FallbackReason::UnsupportedFormat,
        FilterError::CorruptArchive(_) => FallbackReason::ExtractionError,
        FilterError::RebuildFailed(_) => FallbackReason::RebuildFailed,
    }
}
