//! Reduced copies of archives, held in self-deleting temporary files.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::TempPath;
use tracing::{debug, info, warn};

use super::inspect::zip_files;
use super::{ArchiveEntry, ArchiveFormat};
use crate::codec::{retry_without_parallel, Decoder, Encoder, TarCodec};
use crate::error::FilterError;
use crate::io::LocalFileReader;
use crate::zip::ZipRebuilder;

/// File name prefix of every rebuilt archive.
pub const FILTERED_PREFIX: &str = "logsieve-filtered-";

#[derive(Debug, Clone)]
pub struct RebuildOptions {
    pub temp_dir: PathBuf,
    pub prefer_parallel: bool,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            prefer_parallel: true,
        }
    }
}

/// A rebuilt archive on disk. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct FilteredArchive {
    path: TempPath,
    format: ArchiveFormat,
    entries: usize,
    size: u64,
}

impl FilteredArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Size of the rebuilt file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Write the `selected` entries of `source` into a new temporary archive
/// of the same format.
pub async fn rebuild(
    source: &Path,
    format: ArchiveFormat,
    selected: &[ArchiveEntry],
    options: &RebuildOptions,
) -> Result<FilteredArchive, FilterError> {
    if selected.is_empty() {
        return Err(FilterError::RebuildFailed("no entries selected".to_string()));
    }

    let indices: HashSet<usize> = selected.iter().map(|e| e.index).collect();
    let (file, path) = tempfile::Builder::new()
        .prefix(FILTERED_PREFIX)
        .suffix(format.extension())
        .tempfile_in(&options.temp_dir)
        .map_err(|e| {
            FilterError::RebuildFailed(format!(
                "cannot create temporary archive in {}: {}",
                options.temp_dir.display(),
                e
            ))
        })?
        .into_parts();

    match format.tar_codec() {
        Some(codec) => {
            drop(file);
            let source = source.to_path_buf();
            let target = path.to_path_buf();
            let prefer_parallel = options.prefer_parallel;
            tokio::task::spawn_blocking(move || {
                retry_without_parallel(codec, prefer_parallel, |parallel| {
                    write_tar(&source, &target, codec, parallel, &indices)
                })
            })
            .await
            .map_err(|e| FilterError::RebuildFailed(format!("rebuild task failed: {e}")))??;
        }
        None => write_zip(source, file, &indices).await?,
    }

    let size = std::fs::metadata(&path)?.len();
    info!(
        source = %source.display(),
        target = %path.display(),
        entries = selected.len(),
        size,
        "filtered archive written"
    );

    Ok(FilteredArchive {
        path,
        format,
        entries: selected.len(),
        size,
    })
}

fn write_tar(
    source: &Path,
    target: &Path,
    codec: TarCodec,
    parallel: bool,
    indices: &HashSet<usize>,
) -> Result<(), FilterError> {
    let decoder = Decoder::open(source, codec, parallel)?;
    let out = OpenOptions::new().write(true).truncate(true).open(target)?;
    let mut builder = tar::Builder::new(Encoder::create(out, codec, parallel)?);
    let mut archive = tar::Archive::new(decoder);

    let mut index = 0usize;
    let mut remaining = indices.len();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        if indices.contains(&index) {
            let name = entry.path()?.into_owned();
            let mut header = entry.header().clone();
            builder.append_data(&mut header, &name, &mut entry)?;
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }
        index += 1;
    }

    if remaining > 0 {
        return Err(FilterError::RebuildFailed(format!(
            "{remaining} selected entries missing from source"
        )));
    }

    builder.into_inner()?.finish()?;
    debug!(target = %target.display(), parallel, "tar stream rebuilt");
    Ok(())
}

async fn write_zip(source: &Path, file: File, indices: &HashSet<usize>) -> Result<(), FilterError> {
    let reader = LocalFileReader::new(source).map_err(rebuild_failed)?;
    let rebuilder = ZipRebuilder::new(Arc::new(reader));
    let listing = rebuilder.list_files().await.map_err(rebuild_failed)?;

    let selected: Vec<_> = zip_files(&listing)
        .filter(|(index, _)| indices.contains(index))
        .map(|(_, entry)| entry)
        .collect();
    if selected.len() != indices.len() {
        return Err(FilterError::RebuildFailed(format!(
            "{} selected entries missing from source",
            indices.len() - selected.len()
        )));
    }

    let mut out = tokio::fs::File::from_std(file);
    rebuilder
        .write_selected(&selected, &mut out)
        .await
        .map_err(rebuild_failed)?;
    out.sync_all().await?;
    Ok(())
}

fn rebuild_failed(err: anyhow::Error) -> FilterError {
    FilterError::RebuildFailed(err.to_string())
}

/// Remove rebuilt archives left behind by a crashed process.
///
/// Only files named with [`FILTERED_PREFIX`] and older than `max_age`
/// are touched. Returns how many were removed.
pub fn sweep_stale(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(FILTERED_PREFIX) {
            continue;
        }

        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %entry.path().display(), error = %err, "cannot remove stale archive"),
        }
    }

    if removed > 0 {
        info!(dir = %dir.display(), removed, "stale filtered archives removed");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_only_touches_old_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(format!("{FILTERED_PREFIX}abc.tar.gz"));
        let unrelated = dir.path().join("upload.tar.gz");
        std::fs::write(&stale, b"x").unwrap();
        std::fs::write(&unrelated, b"x").unwrap();

        assert_eq!(sweep_stale(dir.path(), Duration::from_secs(3600)).unwrap(), 0);
        assert!(stale.exists());

        assert_eq!(sweep_stale(dir.path(), Duration::ZERO).unwrap(), 1);
        assert!(!stale.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn missing_temp_dir_is_a_rebuild_failure() {
        let dir = tempfile::tempdir().unwrap();
        let entry = ArchiveEntry {
            index: 0,
            path: "a.log".to_string(),
            modified: chrono::DateTime::UNIX_EPOCH,
            size: 1,
        };
        let options = RebuildOptions {
            temp_dir: dir.path().join("missing"),
            prefer_parallel: false,
        };
        let err = rebuild(&dir.path().join("src.tar.gz"), ArchiveFormat::TarGz, &[entry], &options)
            .await
            .unwrap_err();
        assert!(matches!(err, FilterError::RebuildFailed(_)));
    }
}
