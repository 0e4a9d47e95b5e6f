//! Stream codecs for compressed tar archives.
//!
//! Every codec has a built-in implementation (`bzip2`, `flate2`). When a
//! parallel-capable tool (`lbzip2`, `pbzip2`, `pigz`) is on `PATH` and the
//! caller prefers it, the tool is spawned instead. The choice never changes
//! the decompressed bytes. Spawn failures fall back to the built-in codec
//! on the spot; run failures are retried by [`retry_without_parallel`].

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::OnceLock;

use bzip2::read::MultiBzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use tracing::debug;

/// Compression wrapped around a tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCodec {
    Bzip2,
    Gzip,
}

impl TarCodec {
    fn parallel_tools(self) -> &'static [&'static str] {
        match self {
            TarCodec::Bzip2 => &["lbzip2", "pbzip2"],
            TarCodec::Gzip => &["pigz"],
        }
    }

    /// First parallel tool found on `PATH`, looked up once per process.
    pub fn parallel_tool(self) -> Option<&'static Path> {
        static BZIP2: OnceLock<Option<PathBuf>> = OnceLock::new();
        static GZIP: OnceLock<Option<PathBuf>> = OnceLock::new();

        let cell = match self {
            TarCodec::Bzip2 => &BZIP2,
            TarCodec::Gzip => &GZIP,
        };
        cell.get_or_init(|| self.parallel_tools().iter().find_map(|tool| find_in_path(tool)))
            .as_deref()
    }
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Run `op` with the parallel preference and repeat it once with the
/// built-in codec if it fails while a parallel tool was in play.
pub fn retry_without_parallel<T, E: std::fmt::Display>(
    codec: TarCodec,
    prefer_parallel: bool,
    mut op: impl FnMut(bool) -> Result<T, E>,
) -> Result<T, E> {
    let parallel = prefer_parallel && codec.parallel_tool().is_some();
    match op(parallel) {
        Err(err) if parallel => {
            debug!(error = %err, ?codec, "parallel codec run failed, retrying with built-in codec");
            op(false)
        }
        other => other,
    }
}

/// Decompressing reader over an archive file.
pub enum Decoder {
    Native(Box<dyn Read + Send>),
    External(ExternalDecoder),
}

impl Decoder {
    pub fn open(path: &Path, codec: TarCodec, prefer_parallel: bool) -> io::Result<Self> {
        if prefer_parallel {
            if let Some(tool) = codec.parallel_tool() {
                match ExternalDecoder::spawn(tool, path) {
                    Ok(decoder) => return Ok(Decoder::External(decoder)),
                    Err(err) => {
                        debug!(tool = %tool.display(), error = %err, "parallel decoder unavailable");
                    }
                }
            }
        }

        let file = BufReader::new(File::open(path)?);
        let reader: Box<dyn Read + Send> = match codec {
            TarCodec::Bzip2 => Box::new(MultiBzDecoder::new(file)),
            TarCodec::Gzip => Box::new(MultiGzDecoder::new(file)),
        };
        Ok(Decoder::Native(reader))
    }
}

impl Read for Decoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoder::Native(reader) => reader.read(buf),
            Decoder::External(reader) => reader.read(buf),
        }
    }
}

/// `<tool> -d -c <path>` with its stdout as the decompressed stream.
pub struct ExternalDecoder {
    child: Child,
    stdout: ChildStdout,
    reaped: bool,
}

impl ExternalDecoder {
    fn spawn(tool: &Path, path: &Path) -> io::Result<Self> {
        let mut child = Command::new(tool)
            .arg("-d")
            .arg("-c")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("decoder stdout not captured"))?;
        Ok(Self {
            child,
            stdout,
            reaped: false,
        })
    }
}

impl Read for ExternalDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.reaped {
            self.reaped = true;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::other(format!("decoder exited with {status}")));
            }
        }
        Ok(n)
    }
}

impl Drop for ExternalDecoder {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Compressing writer into an output file.
pub enum Encoder {
    Bzip2(BzEncoder<BufWriter<File>>),
    Gzip(GzEncoder<BufWriter<File>>),
    External(ExternalEncoder),
}

impl Encoder {
    pub fn create(out: File, codec: TarCodec, prefer_parallel: bool) -> io::Result<Self> {
        if prefer_parallel {
            if let Some(tool) = codec.parallel_tool() {
                match ExternalEncoder::spawn(tool, &out) {
                    Ok(encoder) => return Ok(Encoder::External(encoder)),
                    Err(err) => {
                        debug!(tool = %tool.display(), error = %err, "parallel encoder unavailable");
                    }
                }
            }
        }

        let out = BufWriter::new(out);
        Ok(match codec {
            TarCodec::Bzip2 => Encoder::Bzip2(BzEncoder::new(out, bzip2::Compression::default())),
            TarCodec::Gzip => Encoder::Gzip(GzEncoder::new(out, flate2::Compression::default())),
        })
    }

    /// Flush the compressed stream and wait for an external tool to exit.
    pub fn finish(self) -> io::Result<()> {
        match self {
            Encoder::Bzip2(encoder) => encoder.finish()?.flush(),
            Encoder::Gzip(encoder) => encoder.finish()?.flush(),
            Encoder::External(encoder) => encoder.finish(),
        }
    }
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Bzip2(w) => w.write(buf),
            Encoder::Gzip(w) => w.write(buf),
            Encoder::External(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Bzip2(w) => w.flush(),
            Encoder::Gzip(w) => w.flush(),
            Encoder::External(w) => w.flush(),
        }
    }
}

/// `<tool> -c` fed through stdin, writing straight into the output file.
pub struct ExternalEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ExternalEncoder {
    fn spawn(tool: &Path, out: &File) -> io::Result<Self> {
        let mut child = Command::new(tool)
            .arg("-c")
            .stdin(Stdio::piped())
            .stdout(Stdio::from(out.try_clone()?))
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child.stdin.take();
        Ok(Self { child, stdin })
    }

    fn finish(mut self) -> io::Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait()?;
        if !status.success() {
            return Err(io::Error::other(format!("encoder exited with {status}")));
        }
        Ok(())
    }

    fn pipe(&mut self) -> io::Result<&mut ChildStdin> {
        self.stdin
            .as_mut()
            .ok_or_else(|| io::Error::other("encoder stdin already closed"))
    }
}

impl Write for ExternalEncoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pipe()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.pipe()?.flush()
    }
}

impl Drop for ExternalEncoder {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(codec: TarCodec, prefer_parallel: bool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let payload: Vec<u8> = (0..50_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect();

        let mut encoder =
            Encoder::create(File::create(&path).unwrap(), codec, prefer_parallel).unwrap();
        encoder.write_all(&payload).unwrap();
        encoder.finish().unwrap();

        let mut decoded = Vec::new();
        Decoder::open(&path, codec, prefer_parallel)
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn builtin_codecs_round_trip() {
        round_trip(TarCodec::Bzip2, false);
        round_trip(TarCodec::Gzip, false);
    }

    #[test]
    fn parallel_preference_is_transparent() {
        // Uses a parallel tool only when one is installed
        round_trip(TarCodec::Bzip2, true);
        round_trip(TarCodec::Gzip, true);
    }

    #[test]
    fn retry_only_happens_with_a_parallel_tool() {
        let mut calls = Vec::new();
        let result: Result<(), String> =
            retry_without_parallel(TarCodec::Gzip, false, |parallel| {
                calls.push(parallel);
                Err("boom".to_string())
            });
        assert!(result.is_err());
        assert_eq!(calls, vec![false]);
    }
}
