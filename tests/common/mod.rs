#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use logsieve::archive::ArchiveFormat;
use logsieve::error::{ParseError, ParseErrorKind, RunError};
use logsieve::parser::{ParseRequest, ParserAdapter, RawOutput};

pub struct Fixture {
    pub name: String,
    pub modified: DateTime<Utc>,
    pub contents: Vec<u8>,
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
}

/// One 1000-byte log every six hours, 2024-05-01 to 2024-05-10.
pub fn ten_days() -> Vec<Fixture> {
    (0..40)
        .map(|i| {
            let modified = at(1, 0) + Duration::hours(6 * i);
            Fixture {
                name: format!("var/log/app-{i:02}.log"),
                modified,
                contents: vec![b'a' + (i % 26) as u8; 1000],
            }
        })
        .collect()
}

pub fn write_archive(path: &Path, format: ArchiveFormat, files: &[Fixture]) {
    let file = File::create(path).unwrap();
    match format {
        ArchiveFormat::TarGz => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            write_tar(encoder, files).finish().unwrap();
        }
        ArchiveFormat::TarBz2 => {
            let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
            write_tar(encoder, files).finish().unwrap();
        }
        ArchiveFormat::Zip => {
            drop(file);
            write_zip(path, files);
        }
    }
}

fn write_tar<W: Write>(out: W, files: &[Fixture]) -> W {
    let mut builder = tar::Builder::new(out);

    // A directory entry that must never be listed
    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o755);
    dir.set_mtime(at(1, 0).timestamp() as u64);
    builder
        .append_data(&mut dir, "var/log/", std::io::empty())
        .unwrap();

    for fixture in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(fixture.contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(fixture.modified.timestamp() as u64);
        builder
            .append_data(&mut header, &fixture.name, fixture.contents.as_slice())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

/// Minimal STORED zip with an extended timestamp on every entry.
fn write_zip(path: &Path, files: &[Fixture]) {
    let mut out = Vec::new();
    let mut central = Vec::new();

    for fixture in files {
        let offset = out.len() as u32;
        let mut crc = flate2::Crc::new();
        crc.update(&fixture.contents);
        let crc = crc.sum();
        let size = fixture.contents.len() as u32;
        let (time, date) = dos_time(fixture.modified);
        let mut extra = Vec::new();
        extra.write_u16::<LittleEndian>(0x5455).unwrap();
        extra.write_u16::<LittleEndian>(5).unwrap();
        extra.write_u8(1).unwrap();
        extra
            .write_i32::<LittleEndian>(fixture.modified.timestamp() as i32)
            .unwrap();

        out.write_u32::<LittleEndian>(0x04034b50).unwrap();
        out.write_u16::<LittleEndian>(20).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(time).unwrap();
        out.write_u16::<LittleEndian>(date).unwrap();
        out.write_u32::<LittleEndian>(crc).unwrap();
        out.write_u32::<LittleEndian>(size).unwrap();
        out.write_u32::<LittleEndian>(size).unwrap();
        out.write_u16::<LittleEndian>(fixture.name.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(extra.len() as u16).unwrap();
        out.extend_from_slice(fixture.name.as_bytes());
        out.extend_from_slice(&extra);
        out.extend_from_slice(&fixture.contents);

        central.write_u32::<LittleEndian>(0x02014b50).unwrap();
        central.write_u16::<LittleEndian>(0x031e).unwrap();
        central.write_u16::<LittleEndian>(20).unwrap();
        central.write_u16::<LittleEndian>(0).unwrap();
        central.write_u16::<LittleEndian>(0).unwrap();
        central.write_u16::<LittleEndian>(time).unwrap();
        central.write_u16::<LittleEndian>(date).unwrap();
        central.write_u32::<LittleEndian>(crc).unwrap();
        central.write_u32::<LittleEndian>(size).unwrap();
        central.write_u32::<LittleEndian>(size).unwrap();
        central.write_u16::<LittleEndian>(fixture.name.len() as u16).unwrap();
        central.write_u16::<LittleEndian>(extra.len() as u16).unwrap();
        central.write_u16::<LittleEndian>(0).unwrap();
        central.write_u16::<LittleEndian>(0).unwrap();
        central.write_u16::<LittleEndian>(0).unwrap();
        central.write_u32::<LittleEndian>(0o100644 << 16).unwrap();
        central.write_u32::<LittleEndian>(offset).unwrap();
        central.extend_from_slice(fixture.name.as_bytes());
        central.extend_from_slice(&extra);
    }

    let cd_offset = out.len() as u32;
    let cd_size = central.len() as u32;
    out.extend_from_slice(&central);
    out.write_u32::<LittleEndian>(0x06054b50).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(files.len() as u16).unwrap();
    out.write_u16::<LittleEndian>(files.len() as u16).unwrap();
    out.write_u32::<LittleEndian>(cd_size).unwrap();
    out.write_u32::<LittleEndian>(cd_offset).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();

    std::fs::write(path, out).unwrap();
}

fn dos_time(t: DateTime<Utc>) -> (u16, u16) {
    let time = ((t.hour() << 11) | (t.minute() << 5) | (t.second() / 2)) as u16;
    let date = (((t.year() - 1980) as u32) << 9 | t.month() << 5 | t.day()) as u16;
    (time, date)
}

/// Names and contents of the regular files in a tar archive.
pub fn tar_contents(path: &Path, format: ArchiveFormat) -> Vec<(String, Vec<u8>)> {
    let file = File::open(path).unwrap();
    let decoder: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(flate2::read::MultiGzDecoder::new(file)),
        ArchiveFormat::TarBz2 => Box::new(bzip2::read::MultiBzDecoder::new(file)),
        ArchiveFormat::Zip => panic!("not a tar archive"),
    };
    let mut archive = tar::Archive::new(decoder);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).unwrap();
            (name, contents)
        })
        .collect()
}

#[derive(Clone)]
pub enum Behavior {
    Output(String),
    Fail(ParseErrorKind),
    /// Runs until cancelled
    Block,
    /// Output is complete when the cancellation arrives
    CancelAfterOutput(String),
    /// Takes the worker down
    Panic,
}

/// What the fake engine saw on one call.
#[derive(Debug, Clone)]
pub struct Call {
    pub mode: String,
    pub archive: PathBuf,
    pub archive_existed: bool,
}

/// Scripted stand-in for the legacy engine.
pub struct FakeAdapter {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<Call>>,
}

impl FakeAdapter {
    pub fn new(behaviors: &[(&str, Behavior)]) -> Self {
        Self {
            behaviors: behaviors
                .iter()
                .map(|(mode, behavior)| (mode.to_string(), behavior.clone()))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn modes_called(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.mode.clone()).collect()
    }
}

#[async_trait]
impl ParserAdapter for FakeAdapter {
    async fn run(
        &self,
        request: &ParseRequest,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, RunError> {
        self.calls.lock().push(Call {
            mode: request.mode.to_string(),
            archive: request.archive.clone(),
            archive_existed: request.archive.exists(),
        });

        let behavior = self
            .behaviors
            .get(request.mode.as_str())
            .cloned()
            .unwrap_or_else(|| Behavior::Output(format!("{} ok", request.mode)));
        match behavior {
            Behavior::Output(text) => Ok(RawOutput::from_text(text)),
            Behavior::Fail(kind) => Err(ParseError::new(kind, "scripted failure").into()),
            Behavior::Block => {
                cancel.cancelled().await;
                Err(RunError::Cancelled)
            }
            Behavior::CancelAfterOutput(text) => {
                cancel.cancel();
                Ok(RawOutput::from_text(text))
            }
            Behavior::Panic => panic!("engine adapter crashed on {}", request.mode),
        }
    }
}
