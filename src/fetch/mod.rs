//! Resource transfers
//!
//! Streaming download with progress reporting, cancellation and content
//! verification. Bytes land next to the final name with a `.download`
//! suffix; the file is renamed into place only after the digest matches.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Called with whole percentages as a transfer advances
pub type ProgressFn = Box<dyn Fn(u8) + Send>;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Network(String),
    #[error("Transfer failed: {0}")]
    Failed(String),
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("Transfer canceled")]
    Canceled,
    #[error("File error: {0}")]
    Io(String),
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub path: PathBuf,
    pub total_bytes: u64,
}

/// How the dispatcher acquires file contents. HTTP in production; tests
/// substitute their own.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        expected_hash: &str,
        cancel: CancellationToken,
        progress: Option<ProgressFn>,
    ) -> Result<FetchOutcome, FetchError>;
}

pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        expected_hash: &str,
        cancel: CancellationToken,
        progress: Option<ProgressFn>,
    ) -> Result<FetchOutcome, FetchError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::Io(e.to_string()))?;
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Failed(format!("HTTP {}", response.status())));
        }

        debug!(url, dest = %dest.display(), "Starting transfer");

        let tmp_path = temp_path(dest);
        let result =
            stream_and_verify(response, &tmp_path, dest, expected_hash, &cancel, progress).await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }

        result
    }
}

async fn stream_and_verify(
    response: reqwest::Response,
    tmp_path: &Path,
    dest: &Path,
    expected_hash: &str,
    cancel: &CancellationToken,
    progress: Option<ProgressFn>,
) -> Result<FetchOutcome, FetchError> {
    let total_size = response.content_length().unwrap_or(0);
    let mut file = fs::File::create(tmp_path)
        .await
        .map_err(|e| FetchError::Io(e.to_string()))?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_percent: Option<u8> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Canceled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|e| FetchError::Network(e.to_string()))?;

        file.write_all(&chunk)
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;
        downloaded += chunk.len() as u64;

        if let Some(callback) = &progress {
            if total_size > 0 {
                let percent = ((downloaded * 100) / total_size).min(100) as u8;
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    callback(percent);
                }
            }
        }
    }

    file.flush()
        .await
        .map_err(|e| FetchError::Io(e.to_string()))?;
    drop(file);

    let actual = file_sha256(tmp_path)
        .await
        .map_err(|e| FetchError::Io(e.to_string()))?;
    if !actual.eq_ignore_ascii_case(expected_hash) {
        return Err(FetchError::ChecksumMismatch {
            expected: expected_hash.to_lowercase(),
            actual,
        });
    }

    fs::rename(tmp_path, dest)
        .await
        .map_err(|e| FetchError::Io(e.to_string()))?;

    debug!(dest = %dest.display(), bytes = downloaded, "Transfer complete");

    Ok(FetchOutcome {
        path: dest.to_path_buf(),
        total_bytes: downloaded,
    })
}

fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".download");
    dest.with_file_name(name)
}

/// Lowercase hex SHA-256 of a file, read in chunks.
pub async fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
