//! Entry listing without extraction.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use super::{ArchiveEntry, ArchiveFormat};
use crate::codec::{retry_without_parallel, Decoder, TarCodec};
use crate::error::FilterError;
use crate::io::LocalFileReader;
use crate::zip::{ZipFileEntry, ZipParser};

/// List the regular files of an archive in archive order.
///
/// Tar archives are streamed through the decompressor and only their
/// headers are kept; zip archives are listed from the central directory.
/// Nothing is written to disk.
pub async fn inspect(
    path: &Path,
    format: ArchiveFormat,
    prefer_parallel: bool,
) -> Result<Vec<ArchiveEntry>, FilterError> {
    let entries = match format.tar_codec() {
        Some(codec) => {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || {
                retry_without_parallel(codec, prefer_parallel, |parallel| {
                    list_tar(&path, codec, parallel)
                })
            })
            .await
            .map_err(|e| FilterError::CorruptArchive(format!("listing task failed: {e}")))??
        }
        None => list_zip(path).await?,
    };

    debug!(path = %path.display(), %format, entries = entries.len(), "archive inspected");
    Ok(entries)
}

pub(crate) fn list_tar(
    path: &Path,
    codec: TarCodec,
    parallel: bool,
) -> Result<Vec<ArchiveEntry>, FilterError> {
    let decoder = Decoder::open(path, codec, parallel).map_err(corrupt)?;
    let mut archive = tar::Archive::new(decoder);
    let mut entries = Vec::new();

    for entry in archive.entries().map_err(corrupt)? {
        let entry = entry.map_err(corrupt)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry.path().map_err(corrupt)?.to_string_lossy().into_owned();
        let mtime = entry.header().mtime().map_err(corrupt)?;
        entries.push(ArchiveEntry {
            index: entries.len(),
            path: name,
            modified: from_unix(mtime),
            size: entry.size(),
        });
    }

    Ok(entries)
}

async fn list_zip(path: &Path) -> Result<Vec<ArchiveEntry>, FilterError> {
    let reader = LocalFileReader::new(path).map_err(|e| FilterError::CorruptArchive(e.to_string()))?;
    let parser = ZipParser::new(Arc::new(reader));
    let listing = parser
        .list_files()
        .await
        .map_err(|e| FilterError::CorruptArchive(e.to_string()))?;

    Ok(zip_files(&listing)
        .map(|(index, entry)| ArchiveEntry {
            index,
            path: entry.file_name.clone(),
            modified: entry.modified().unwrap_or(DateTime::UNIX_EPOCH),
            size: entry.uncompressed_size,
        })
        .collect())
}

/// Regular files of a zip listing, numbered the way [`inspect`] numbers them.
pub(crate) fn zip_files(listing: &[ZipFileEntry]) -> impl Iterator<Item = (usize, &ZipFileEntry)> {
    listing.iter().filter(|e| !e.is_directory).enumerate()
}

fn from_unix(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn corrupt(err: std::io::Error) -> FilterError {
    FilterError::CorruptArchive(err.to_string())
}
