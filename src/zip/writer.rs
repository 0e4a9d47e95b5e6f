use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::io::ReadAt;
use anyhow::{bail, Result};

use super::parser::ZipParser;
use super::structures::{EndOfCentralDirectory, ZipFileEntry, CDFH_LFH_OFFSET_POS};

/// Copy chunk size for local records
const COPY_CHUNK: usize = 64 * 1024;

/// Writes a reduced copy of a ZIP archive.
///
/// Selected entries are copied byte for byte (local header, compressed
/// data and data descriptor), so nothing is recompressed. A fresh Central
/// Directory pointing at the new offsets closes the archive.
pub struct ZipRebuilder<R: ReadAt> {
    parser: ZipParser<R>,
}

impl<R: ReadAt> ZipRebuilder<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self {
            parser: ZipParser::new(reader),
        }
    }

    /// List all entries of the source archive
    pub async fn list_files(&self) -> Result<Vec<ZipFileEntry>> {
        self.parser.list_files().await
    }

    /// Write `selected` (in the given order) as a new archive into `out`.
    ///
    /// Returns the number of bytes written. ZIP64 entries are rejected.
    pub async fn write_selected<W>(&self, selected: &[&ZipFileEntry], out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if selected.len() >= 0xFFFF {
            bail!("Too many entries for a non-ZIP64 archive: {}", selected.len());
        }
        if let Some(entry) = selected.iter().find(|e| e.is_zip64) {
            bail!("ZIP64 entry cannot be rewritten: {}", entry.file_name);
        }

        let mut written = 0u64;
        let mut central_directory = Vec::new();
        let mut buf = vec![0u8; COPY_CHUNK];

        for entry in selected {
            let (offset, len) = self.parser.local_record_extent(entry).await?;
            let new_offset = u32::try_from(written)
                .map_err(|_| anyhow::anyhow!("Rebuilt archive exceeds 4 GiB"))?;

            let mut copied = 0u64;
            while copied < len {
                let chunk = (len - copied).min(COPY_CHUNK as u64) as usize;
                self.parser
                    .reader()
                    .read_exact_at(offset + copied, &mut buf[..chunk])
                    .await?;
                out.write_all(&buf[..chunk]).await?;
                copied += chunk as u64;
            }
            written += len;

            let mut record = entry.cd_record.clone();
            if record.len() < CDFH_LFH_OFFSET_POS + 4 {
                bail!("Truncated Central Directory record for {}", entry.file_name);
            }
            record[CDFH_LFH_OFFSET_POS..CDFH_LFH_OFFSET_POS + 4]
                .copy_from_slice(&new_offset.to_le_bytes());
            central_directory.extend_from_slice(&record);
        }

        let cd_offset = u32::try_from(written)
            .map_err(|_| anyhow::anyhow!("Rebuilt archive exceeds 4 GiB"))?;
        let cd_size = central_directory.len() as u32;
        out.write_all(&central_directory).await?;

        let eocd = EndOfCentralDirectory::single_disk(selected.len() as u16, cd_size, cd_offset);
        let eocd = eocd.to_bytes();
        out.write_all(&eocd).await?;
        out.flush().await?;

        Ok(written + cd_size as u64 + eocd.len() as u64)
    }
}
