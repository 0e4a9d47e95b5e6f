//! On-disk ZIP records and the little-endian layouts they use.

use anyhow::{bail, ensure, Result};
use byteorder::{ByteOrder, LittleEndian as LE};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

pub const LFH_SIGNATURE: [u8; 4] = *b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;
/// Position of the name and extra lengths inside a local header
const LFH_LENGTHS_POS: usize = 26;

pub const CDFH_SIGNATURE: [u8; 4] = *b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;
/// Position of the local header offset inside a central record
pub const CDFH_LFH_OFFSET_POS: usize = 42;

pub const DATA_DESCRIPTOR_SIGNATURE: [u8; 4] = *b"PK\x07\x08";

/// General purpose bit 3: CRC and sizes trail the data
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;

pub const EXTRA_ZIP64: u16 = 0x0001;
/// Info-ZIP extended timestamp ("UT")
pub const EXTRA_EXT_TIMESTAMP: u16 = 0x5455;

const U16_MAX: u16 = u16::MAX;
const U32_MAX: u32 = u32::MAX;

/// Location of the central directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryLocation {
    pub offset: u64,
    pub size: u64,
    pub entries: u64,
}

impl DirectoryLocation {
    /// Read the location from a ZIP64 end of central directory record.
    pub fn from_zip64_record(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= ZIP64_EOCD_MIN_SIZE && data[..4] == ZIP64_EOCD_SIGNATURE,
            "Invalid ZIP64 end of central directory"
        );
        Ok(Self {
            entries: LE::read_u64(&data[32..40]),
            size: LE::read_u64(&data[40..48]),
            offset: LE::read_u64(&data[48..56]),
        })
    }
}

pub const ZIP64_EOCD_SIGNATURE: [u8; 4] = *b"PK\x06\x06";
pub const ZIP64_EOCD_MIN_SIZE: usize = 56;
pub const ZIP64_LOCATOR_SIGNATURE: [u8; 4] = *b"PK\x06\x07";
pub const ZIP64_LOCATOR_SIZE: usize = 20;

/// Offset of the ZIP64 end record named by a locator.
pub fn zip64_record_offset(locator: &[u8]) -> Result<u64> {
    ensure!(
        locator.len() >= ZIP64_LOCATOR_SIZE && locator[..4] == ZIP64_LOCATOR_SIGNATURE,
        "Invalid ZIP64 locator"
    );
    Ok(LE::read_u64(&locator[8..16]))
}

/// End of central directory record, without its comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk: u16,
    pub entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: [u8; 4] = *b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= Self::SIZE && data[..4] == Self::SIGNATURE,
            "Invalid End of Central Directory"
        );
        let eocd = Self {
            disk: LE::read_u16(&data[4..6]),
            entries: LE::read_u16(&data[10..12]),
            cd_size: LE::read_u32(&data[12..16]),
            cd_offset: LE::read_u32(&data[16..20]),
            comment_len: LE::read_u16(&data[20..22]),
        };
        if eocd.disk != 0 && eocd.disk != U16_MAX {
            bail!("Multi-disk archives are not supported");
        }
        Ok(eocd)
    }

    pub fn single_disk(entries: u16, cd_size: u32, cd_offset: u32) -> Self {
        Self {
            disk: 0,
            entries,
            cd_size,
            cd_offset,
            comment_len: 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&Self::SIGNATURE);
        LE::write_u16(&mut buf[4..6], self.disk);
        LE::write_u16(&mut buf[6..8], self.disk);
        LE::write_u16(&mut buf[8..10], self.entries);
        LE::write_u16(&mut buf[10..12], self.entries);
        LE::write_u32(&mut buf[12..16], self.cd_size);
        LE::write_u32(&mut buf[16..20], self.cd_offset);
        buf.to_vec()
    }

    /// Any saturated field means the real values live in the ZIP64 record.
    pub fn is_zip64(&self) -> bool {
        self.entries == U16_MAX || self.cd_size == U32_MAX || self.cd_offset == U32_MAX
    }

    pub fn location(&self) -> DirectoryLocation {
        DirectoryLocation {
            offset: self.cd_offset as u64,
            size: self.cd_size as u64,
            entries: self.entries as u64,
        }
    }
}

/// Length of the name and extra field that follow a local header.
pub fn local_header_tail(header: &[u8]) -> Result<u64> {
    ensure!(
        header.len() >= LFH_SIZE && header[..4] == LFH_SIGNATURE,
        "Invalid Local File Header"
    );
    let name_len = LE::read_u16(&header[LFH_LENGTHS_POS..]) as u64;
    let extra_len = LE::read_u16(&header[LFH_LENGTHS_POS + 2..]) as u64;
    Ok(name_len + extra_len)
}

/// One central directory entry.
#[derive(Debug, Clone)]
pub struct ZipFileEntry {
    pub file_name: String,
    pub flags: u16,
    pub method: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub lfh_offset: u64,
    pub dos_time: u16,
    pub dos_date: u16,
    /// Seconds since the epoch from the extended timestamp field
    pub unix_mtime: Option<i64>,
    pub is_directory: bool,
    /// Some field had to be widened through the ZIP64 extra
    pub is_zip64: bool,
    /// The record exactly as stored, reused when rewriting the directory
    pub cd_record: Vec<u8>,
}

impl ZipFileEntry {
    /// Parse the central record at the start of `data`.
    ///
    /// The returned entry's `cd_record` length is the number of bytes
    /// consumed.
    pub fn parse_central(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= CDFH_MIN_SIZE && data[..4] == CDFH_SIGNATURE,
            "Invalid Central Directory File Header"
        );

        let name_len = LE::read_u16(&data[28..30]) as usize;
        let extra_len = LE::read_u16(&data[30..32]) as usize;
        let comment_len = LE::read_u16(&data[32..34]) as usize;
        let name_end = CDFH_MIN_SIZE + name_len;
        let extra_end = name_end + extra_len;
        let record_len = extra_end + comment_len;
        ensure!(
            record_len <= data.len(),
            "Truncated Central Directory File Header"
        );

        let compressed = LE::read_u32(&data[20..24]);
        let uncompressed = LE::read_u32(&data[24..28]);
        let offset = LE::read_u32(&data[CDFH_LFH_OFFSET_POS..CDFH_MIN_SIZE]);
        let file_name = String::from_utf8_lossy(&data[CDFH_MIN_SIZE..name_end]).into_owned();

        let mut entry = Self {
            is_directory: file_name.ends_with('/'),
            file_name,
            flags: LE::read_u16(&data[8..10]),
            method: LE::read_u16(&data[10..12]),
            compressed_size: compressed as u64,
            uncompressed_size: uncompressed as u64,
            lfh_offset: offset as u64,
            dos_time: LE::read_u16(&data[12..14]),
            dos_date: LE::read_u16(&data[14..16]),
            unix_mtime: None,
            is_zip64: compressed == U32_MAX || uncompressed == U32_MAX || offset == U32_MAX,
            cd_record: data[..record_len].to_vec(),
        };

        for (id, body) in ExtraFields(&data[name_end..extra_end]) {
            match id {
                EXTRA_ZIP64 => entry.apply_zip64(body, uncompressed, compressed, offset),
                EXTRA_EXT_TIMESTAMP => {
                    // flags byte, then mtime when bit 0 is set
                    if body.len() >= 5 && body[0] & 1 != 0 {
                        entry.unix_mtime = Some(LE::read_i32(&body[1..5]) as i64);
                    }
                }
                _ => {}
            }
        }

        Ok(entry)
    }

    /// ZIP64 values appear in a fixed order, only for saturated fields.
    fn apply_zip64(&mut self, body: &[u8], uncompressed: u32, compressed: u32, offset: u32) {
        let mut values = body.chunks_exact(8).map(LE::read_u64);
        if uncompressed == U32_MAX {
            if let Some(v) = values.next() {
                self.uncompressed_size = v;
            }
        }
        if compressed == U32_MAX {
            if let Some(v) = values.next() {
                self.compressed_size = v;
            }
        }
        if offset == U32_MAX {
            if let Some(v) = values.next() {
                self.lfh_offset = v;
            }
        }
    }

    /// Modification time in UTC.
    ///
    /// The extended timestamp wins when present. DOS timestamps carry no
    /// zone and are read as UTC. Returns `None` for an invalid DOS date.
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        if let Some(secs) = self.unix_mtime {
            return Utc.timestamp_opt(secs, 0).single();
        }

        let (d, t) = (self.dos_date as u32, self.dos_time as u32);
        let naive = NaiveDate::from_ymd_opt(1980 + (d >> 9) as i32, (d >> 5) & 0x0F, d & 0x1F)?
            .and_hms_opt(t >> 11, (t >> 5) & 0x3F, ((t & 0x1F) * 2).min(59))?;
        Some(Utc.from_utc_datetime(&naive))
    }

    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }
}

/// Iterator over `(id, body)` pairs of an extra field block.
///
/// A truncated trailing field is cut to what remains.
struct ExtraFields<'a>(&'a [u8]);

impl<'a> Iterator for ExtraFields<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.0.len() < 4 {
            return None;
        }
        let id = LE::read_u16(&self.0[..2]);
        let len = (LE::read_u16(&self.0[2..4]) as usize).min(self.0.len() - 4);
        let body = &self.0[4..4 + len];
        self.0 = &self.0[4 + len..];
        Some((id, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn central(name: &str, extra: &[u8], sizes: (u32, u32, u32)) -> Vec<u8> {
        let mut rec = vec![0u8; CDFH_MIN_SIZE];
        rec[..4].copy_from_slice(&CDFH_SIGNATURE);
        // 2024-03-05 13:45:30
        LE::write_u16(&mut rec[12..14], (13 << 11) | (45 << 5) | 15);
        LE::write_u16(&mut rec[14..16], ((2024 - 1980) << 9) | (3 << 5) | 5);
        LE::write_u32(&mut rec[20..24], sizes.0);
        LE::write_u32(&mut rec[24..28], sizes.1);
        LE::write_u16(&mut rec[28..30], name.len() as u16);
        LE::write_u16(&mut rec[30..32], extra.len() as u16);
        LE::write_u32(&mut rec[42..46], sizes.2);
        rec.extend_from_slice(name.as_bytes());
        rec.extend_from_slice(extra);
        rec
    }

    #[test]
    fn dos_timestamp_is_read_as_utc() {
        let mut data = central("log/a.txt", &[], (10, 10, 0));
        data.extend_from_slice(b"next record");
        let entry = ZipFileEntry::parse_central(&data).unwrap();
        assert_eq!(entry.cd_record.len(), CDFH_MIN_SIZE + 9);
        assert_eq!(
            entry.modified().unwrap().to_rfc3339(),
            "2024-03-05T13:45:30+00:00"
        );
        assert!(!entry.is_directory);
        assert!(!entry.is_zip64);
    }

    #[test]
    fn extended_timestamp_wins() {
        let mut extra = Vec::new();
        extra.write_u16::<LE>(EXTRA_EXT_TIMESTAMP).unwrap();
        extra.write_u16::<LE>(5).unwrap();
        extra.write_u8(1).unwrap();
        extra.write_i32::<LE>(1_700_000_000).unwrap();
        let entry = ZipFileEntry::parse_central(&central("a", &extra, (0, 0, 0))).unwrap();
        assert_eq!(entry.modified().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn zip64_extra_widens_saturated_fields() {
        let mut extra = Vec::new();
        extra.write_u16::<LE>(EXTRA_ZIP64).unwrap();
        extra.write_u16::<LE>(16).unwrap();
        extra.write_u64::<LE>(5 << 32).unwrap();
        extra.write_u64::<LE>(7 << 32).unwrap();
        let data = central("big.log", &extra, (10, U32_MAX, U32_MAX));
        let entry = ZipFileEntry::parse_central(&data).unwrap();
        assert!(entry.is_zip64);
        assert_eq!(entry.compressed_size, 10);
        assert_eq!(entry.uncompressed_size, 5 << 32);
        assert_eq!(entry.lfh_offset, 7 << 32);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let data = central("log/a.txt", &[], (0, 0, 0));
        assert!(ZipFileEntry::parse_central(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn zero_dos_date_is_invalid() {
        let mut data = central("a", &[], (0, 0, 0));
        LE::write_u16(&mut data[14..16], 0);
        let entry = ZipFileEntry::parse_central(&data).unwrap();
        assert!(entry.modified().is_none());
    }

    #[test]
    fn eocd_round_trips_through_bytes() {
        let bytes = EndOfCentralDirectory::single_disk(3, 120, 4096).to_bytes();
        let parsed = EndOfCentralDirectory::from_bytes(&bytes).unwrap();
        assert_eq!(
            parsed.location(),
            DirectoryLocation {
                offset: 4096,
                size: 120,
                entries: 3
            }
        );
        assert!(!parsed.is_zip64());
    }
}
