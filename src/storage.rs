//! Turning an upload reference into a local archive path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tempfile::TempPath;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Prefix of downloaded archives in the temp directory.
pub const DOWNLOAD_PREFIX: &str = "logsieve-download-";

/// A local file ready for parsing. Downloaded files are removed on drop.
#[derive(Debug)]
pub enum ResolvedFile {
    Local(PathBuf),
    Downloaded { path: TempPath, bytes: u64 },
}

impl ResolvedFile {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedFile::Local(path) => path,
            ResolvedFile::Downloaded { path, .. } => path,
        }
    }
}

#[async_trait]
pub trait StorageResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<ResolvedFile>;
}

pub fn is_http_url(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Plain paths, optionally relative to a root directory.
#[derive(Debug, Clone, Default)]
pub struct LocalResolver {
    root: Option<PathBuf>,
}

impl LocalResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

#[async_trait]
impl StorageResolver for LocalResolver {
    async fn resolve(&self, reference: &str) -> Result<ResolvedFile> {
        let path = match &self.root {
            Some(root) => root.join(reference),
            None => PathBuf::from(reference),
        };
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Failed to open archive: {}", path.display()))?;
        if !metadata.is_file() {
            bail!("Not a regular file: {}", path.display());
        }
        Ok(ResolvedFile::Local(path))
    }
}

/// Downloads `http(s)://` references into the temp directory.
pub struct HttpResolver {
    client: Client,
    temp_dir: PathBuf,
    max_retry: u32,
    transferred_bytes: AtomicU64,
}

impl HttpResolver {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            temp_dir: temp_dir.into(),
            max_retry: 10,
            transferred_bytes: AtomicU64::new(0),
        })
    }

    /// Get total bytes transferred from network
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    async fn download(&self, url: &str, file: &std::fs::File) -> Result<u64> {
        let mut resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            bail!("HTTP request failed with status: {}", resp.status());
        }

        file.set_len(0)?;
        let mut out = tokio::fs::File::from_std(file.try_clone()?);
        out.seek(std::io::SeekFrom::Start(0)).await?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
            self.transferred_bytes
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        out.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl StorageResolver for HttpResolver {
    async fn resolve(&self, reference: &str) -> Result<ResolvedFile> {
        if !is_http_url(reference) {
            bail!("Not an HTTP URL: {reference}");
        }

        // Keep the remote file name so the archive format can be detected
        // from the extension.
        let suffix = format!("-{}", remote_file_name(reference));
        let (file, path) = tempfile::Builder::new()
            .prefix(DOWNLOAD_PREFIX)
            .suffix(&suffix)
            .tempfile_in(&self.temp_dir)
            .with_context(|| format!("Failed to create file in {}", self.temp_dir.display()))?
            .into_parts();

        let mut retry_count = 0;
        loop {
            match self.download(reference, &file).await {
                Ok(bytes) => {
                    info!(url = reference, path = %path.display(), bytes, "archive downloaded");
                    return Ok(ResolvedFile::Downloaded { path, bytes });
                }
                Err(err) if is_retryable(&err) => {
                    retry_count += 1;
                    if retry_count >= self.max_retry {
                        bail!("Max retries exceeded: {err}");
                    }
                    warn!(
                        url = reference,
                        retry = retry_count,
                        max_retry = self.max_retry,
                        error = %err,
                        "connection error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(500 * retry_count as u64)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<reqwest::Error>()
        .is_some_and(|e| e.is_timeout() || e.is_connect())
}

/// Last path segment of `url`, restricted to characters safe in a file
/// name.
fn remote_file_name(url: &str) -> String {
    let name = reqwest::Url::parse(url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_default();
    let name: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if name.trim_matches('.').is_empty() {
        "archive".to_string()
    } else {
        name
    }
}

/// Local paths and HTTP URLs behind one resolver.
pub struct DefaultResolver {
    local: LocalResolver,
    http: HttpResolver,
}

impl DefaultResolver {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            local: LocalResolver::new(),
            http: HttpResolver::new(temp_dir)?,
        })
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.http.transferred_bytes()
    }
}

#[async_trait]
impl StorageResolver for DefaultResolver {
    async fn resolve(&self, reference: &str) -> Result<ResolvedFile> {
        if is_http_url(reference) {
            debug!(url = reference, "resolving over HTTP");
            self.http.resolve(reference).await
        } else {
            self.local.resolve(reference).await
        }
    }
}
