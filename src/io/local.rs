use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::ReadAt;

/// Positional reads over a file on disk.
///
/// Unix uses `pread`, which needs no shared cursor. Elsewhere reads seek a
/// single handle under a lock.
pub struct LocalFileReader {
    #[cfg(unix)]
    file: File,
    #[cfg(not(unix))]
    file: parking_lot::Mutex<File>,
    size: u64,
}

impl LocalFileReader {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
        let size = file.metadata()?.len();
        #[cfg(not(unix))]
        let file = parking_lot::Mutex::new(file);
        Ok(Self { file, size })
    }
}

#[async_trait]
impl ReadAt for LocalFileReader {
    #[cfg(unix)]
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.read_at(buf, offset)?)
    }

    #[cfg(not(unix))]
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.read(buf)?)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn short_source_fails_exact_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let reader = LocalFileReader::new(file.path()).unwrap();
        assert_eq!(reader.size(), 10);

        let mut buf = [0u8; 4];
        reader.read_exact_at(6, &mut buf).await.unwrap();
        assert_eq!(&buf, b"6789");
        assert!(reader.read_exact_at(8, &mut buf).await.is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = LocalFileReader::new("/no/such/archive.zip").err().unwrap();
        assert!(err.to_string().contains("/no/such/archive.zip"));
    }
}
