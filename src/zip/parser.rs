//! Reads ZIP metadata from the tail of an archive.
//!
//! Listing fetches the end record, then the whole central directory in a
//! single read. Entry data is only touched when a local record has to be
//! measured for rewriting.

use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};

use super::structures::*;
use crate::io::ReadAt;

/// Longest comment the format allows after the end record.
const MAX_COMMENT_SIZE: u64 = u16::MAX as u64;

/// Parser over any [`ReadAt`] source.
///
/// Used by the archive inspector for listing and by
/// [`ZipRebuilder`](super::ZipRebuilder) to locate local records.
pub struct ZipParser<R: ReadAt> {
    reader: Arc<R>,
    size: u64,
}

impl<R: ReadAt> ZipParser<R> {
    pub fn new(reader: Arc<R>) -> Self {
        let size = reader.size();
        Self { reader, size }
    }

    async fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact_at(offset, &mut buf).await?;
        Ok(buf)
    }

    /// Offset of the end record.
    ///
    /// The record sits right at the end unless the archive carries a
    /// comment, in which case the tail is scanned backwards for a
    /// signature whose comment length reaches exactly to the end.
    async fn locate_end_record(&self) -> Result<u64> {
        let eocd_size = EndOfCentralDirectory::SIZE as u64;
        ensure!(self.size >= eocd_size, "Not a valid ZIP file");

        let tail_len = (MAX_COMMENT_SIZE + eocd_size).min(self.size);
        let tail_start = self.size - tail_len;
        let tail = self.read_vec(tail_start, tail_len as usize).await?;

        let last = tail.len() - EndOfCentralDirectory::SIZE;
        let found = (0..=last).rev().find(|&i| {
            tail[i..i + 4] == EndOfCentralDirectory::SIGNATURE
                && u16::from_le_bytes([tail[i + 20], tail[i + 21]]) as usize == last - i
        });

        match found {
            Some(i) => Ok(tail_start + i as u64),
            None => bail!("Not a valid ZIP file"),
        }
    }

    /// Where the central directory is, following the ZIP64 locator when
    /// the end record is saturated.
    async fn directory_location(&self) -> Result<DirectoryLocation> {
        let eocd_offset = self.locate_end_record().await?;
        let eocd = EndOfCentralDirectory::from_bytes(
            &self.read_vec(eocd_offset, EndOfCentralDirectory::SIZE).await?,
        )?;
        if !eocd.is_zip64() {
            return Ok(eocd.location());
        }

        let locator_offset = eocd_offset
            .checked_sub(ZIP64_LOCATOR_SIZE as u64)
            .context("Invalid ZIP64 locator")?;
        let locator = self.read_vec(locator_offset, ZIP64_LOCATOR_SIZE).await?;
        let record_offset = zip64_record_offset(&locator)?;
        let record = self.read_vec(record_offset, ZIP64_EOCD_MIN_SIZE).await?;
        DirectoryLocation::from_zip64_record(&record)
    }

    /// Every central directory entry, directories included, in stored
    /// order.
    pub async fn list_files(&self) -> Result<Vec<ZipFileEntry>> {
        let cd = self.directory_location().await?;

        if cd.offset.checked_add(cd.size).is_none_or(|end| end > self.size) {
            bail!("Central Directory lies outside the archive");
        }
        // Also bounds the allocation below.
        if cd.entries > cd.size / CDFH_MIN_SIZE as u64 {
            bail!("Central Directory is too small for {} entries", cd.entries);
        }

        let data = self.read_vec(cd.offset, cd.size as usize).await?;
        let mut entries = Vec::with_capacity(cd.entries as usize);
        let mut rest = data.as_slice();
        for n in 0..cd.entries {
            let entry = ZipFileEntry::parse_central(rest)
                .with_context(|| format!("Central Directory entry {n}"))?;
            rest = &rest[entry.cd_record.len()..];
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Offset of the entry's data, past its local header.
    ///
    /// The local name and extra field may differ from the central copy,
    /// so the header itself is read.
    pub async fn get_data_offset(&self, entry: &ZipFileEntry) -> Result<u64> {
        let header = self.read_vec(entry.lfh_offset, LFH_SIZE).await?;
        let tail = local_header_tail(&header)
            .with_context(|| format!("Entry {}", entry.file_name))?;
        Ok(entry.lfh_offset + LFH_SIZE as u64 + tail)
    }

    /// Byte extent `(offset, len)` of an entry's complete local record.
    ///
    /// The record spans the local header, the compressed data and, when
    /// general purpose bit 3 is set, the trailing data descriptor (12
    /// bytes, or 16 with its optional signature).
    pub async fn local_record_extent(&self, entry: &ZipFileEntry) -> Result<(u64, u64)> {
        let mut end = self.get_data_offset(entry).await? + entry.compressed_size;

        if entry.has_data_descriptor() {
            let sig = self.read_vec(end, 4).await?;
            end += if sig[..] == DATA_DESCRIPTOR_SIGNATURE { 16 } else { 12 };
        }

        if end > self.size {
            bail!("Entry {} extends past the end of the archive", entry.file_name);
        }
        Ok((entry.lfh_offset, end - entry.lfh_offset))
    }

    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }
}
