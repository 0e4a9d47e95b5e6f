//! Archive pre-filtering.
//!
//! [`inspect`] lists an archive's entries without extracting it,
//! [`filter`] decides which entries fall inside a time window,
//! [`rebuild`] writes a reduced temporary archive and [`prefilter`] ties
//! the three together, absorbing every failure into a [`FilterDecision`].

pub mod filter;
pub mod inspect;
pub mod prefilter;
pub mod rebuild;

pub use filter::{decide, FallbackReason, FilterDecision, FilterPolicy, Selection, TimeWindow};
pub use inspect::inspect;
pub use prefilter::{prefilter, PrefilterOptions, PrefilterOutcome, ResolvedArchive};
pub use rebuild::{rebuild, sweep_stale, FilteredArchive, RebuildOptions, FILTERED_PREFIX};

use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::TarCodec;
use crate::error::FilterError;

/// Container format of a log archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    TarBz2,
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Format from the file name, falling back to the leading magic bytes.
    pub fn detect(path: &Path) -> Result<Self, FilterError> {
        if let Some(format) = Self::from_file_name(path) {
            return Ok(format);
        }

        let mut magic = [0u8; 4];
        let read = std::fs::File::open(path)
            .and_then(|mut file| file.read(&mut magic))
            .map_err(|e| FilterError::UnsupportedFormat(format!("{}: {}", path.display(), e)))?;

        Self::from_magic(&magic[..read]).ok_or_else(|| {
            FilterError::UnsupportedFormat(format!("{}: unrecognized archive", path.display()))
        })
    }

    pub fn from_file_name(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz") {
            Some(ArchiveFormat::TarBz2)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }

    pub fn from_magic(magic: &[u8]) -> Option<Self> {
        if magic.starts_with(b"BZh") {
            Some(ArchiveFormat::TarBz2)
        } else if magic.starts_with(&[0x1f, 0x8b]) {
            Some(ArchiveFormat::TarGz)
        } else if magic.starts_with(b"PK\x03\x04") || magic.starts_with(b"PK\x05\x06") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }

    /// Codec wrapped around the tar stream, `None` for zip.
    pub fn tar_codec(self) -> Option<TarCodec> {
        match self {
            ArchiveFormat::TarBz2 => Some(TarCodec::Bzip2),
            ArchiveFormat::TarGz => Some(TarCodec::Gzip),
            ArchiveFormat::Zip => None,
        }
    }

    /// File name suffix used for rebuilt archives.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarBz2 => ".tar.bz2",
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::Zip => ".zip",
        }
    }
}

impl std::str::FromStr for ArchiveFormat {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tar.bz2" | "tbz2" | "bz2" | "tar_bz2" => Ok(ArchiveFormat::TarBz2),
            "tar.gz" | "tgz" | "gz" | "tar_gz" => Ok(ArchiveFormat::TarGz),
            "zip" => Ok(ArchiveFormat::Zip),
            other => Err(FilterError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ArchiveFormat::TarBz2 => "tar.bz2",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        })
    }
}

/// A regular file inside an archive.
///
/// `index` is the entry's position among the archive's regular files and
/// identifies it during rebuilding, even when paths repeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub index: usize,
    pub path: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_format_from_name() {
        assert_eq!(
            ArchiveFormat::from_file_name(Path::new("dev/logs.TAR.BZ2")),
            Some(ArchiveFormat::TarBz2)
        );
        assert_eq!(
            ArchiveFormat::from_file_name(Path::new("logs.tgz")),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_file_name(Path::new("logs.zip")),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(ArchiveFormat::from_file_name(Path::new("logs.7z")), None);
    }

    #[test]
    fn detects_format_from_magic() {
        assert_eq!(ArchiveFormat::from_magic(b"BZh91AY"), Some(ArchiveFormat::TarBz2));
        assert_eq!(ArchiveFormat::from_magic(&[0x1f, 0x8b, 8, 0]), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_magic(b"PK\x03\x04"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_magic(b"7z\xbc\xaf"), None);
    }

    #[test]
    fn unknown_file_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        std::fs::write(&path, b"plain text").unwrap();
        assert!(matches!(
            ArchiveFormat::detect(&path),
            Err(FilterError::UnsupportedFormat(_))
        ));
    }
}
