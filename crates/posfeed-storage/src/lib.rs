//! Streaming fetch, on-disk artifacts and persistence for posfeed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use posfeed_core::FileIdentity;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub mod batch;
pub mod memory;
pub mod postgres;
pub mod repo;

pub use batch::{BatchWriter, FlushReport};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use repo::{
    ClaimRepo, InsertOutcome, JobRepo, ReportFilter, ReportPage, ReportRepo, Store, StoreError,
    StoreResult, MAX_PAGE_SIZE,
};

pub const CRATE_NAME: &str = "posfeed-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: u64,
}

/// Local mirror of downloaded exports, laid out as `<branch>/<date>/<pos>/<file>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(&self, identity: &FileIdentity) -> PathBuf {
        let branch = sanitize_segment(&identity.branch);
        PathBuf::from(branch)
            .join(identity.work_date.format("%Y-%m-%d").to_string())
            .join(identity.pos.to_string())
            .join(sanitize_segment(&identity.filename()))
    }

    /// Open a temp file next to the final path; bytes are hashed as they are written.
    pub async fn begin(&self, relative_path: PathBuf) -> anyhow::Result<ArtifactWriter> {
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.part", Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;

        Ok(ArtifactWriter {
            file: BufWriter::new(file),
            temp_path,
            absolute_path,
            relative_path,
            hasher: Sha256::new(),
            byte_size: 0,
        })
    }
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "_".to_string(),
        s => s.to_string(),
    }
}

/// Incremental writer for one downloaded file.
#[derive(Debug)]
pub struct ArtifactWriter {
    file: BufWriter<fs::File>,
    temp_path: PathBuf,
    absolute_path: PathBuf,
    relative_path: PathBuf,
    hasher: Sha256,
    byte_size: u64,
}

impl ArtifactWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self.hasher.update(chunk);
        self.byte_size += chunk.len() as u64;
        self.file
            .write_all(chunk)
            .await
            .with_context(|| format!("writing temp artifact file {}", self.temp_path.display()))
    }

    pub fn bytes_written(&self) -> u64 {
        self.byte_size
    }

    /// Flush and atomically move the temp file over the final path.
    pub async fn finish(mut self) -> anyhow::Result<StoredArtifact> {
        self.file
            .flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", self.temp_path.display()))?;
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.absolute_path).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp artifact {} -> {}",
                    self.temp_path.display(),
                    self.absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            content_hash: hex::encode(self.hasher.finalize()),
            relative_path: self.relative_path,
            absolute_path: self.absolute_path,
            byte_size: self.byte_size,
        })
    }

    pub async fn abort(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the given 1-based attempt failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1) as u32;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timed out waiting for {url}")]
    Timeout { url: String },
    #[error("stream interrupted: {0}")]
    Stream(String),
    #[error("source not found: {0}")]
    NotFound(String),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Timeout { .. } | FetchError::Stream(_) => RetryDisposition::Retryable,
            FetchError::NotFound(_) => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Anything that can open a byte stream for a file URL. One call is one attempt;
/// retries belong to the caller.
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<ByteStream, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Send a small request and read the whole body as text, retrying
    /// transient failures with the configured backoff.
    pub async fn fetch_text<F>(&self, url: &str, build: F) -> Result<String, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("http_fetch", url);
        async {
            let mut attempt = 1;
            loop {
                let _permit = self
                    .global_limit
                    .acquire()
                    .await
                    .map_err(|_| FetchError::Stream("fetcher shut down".to_string()))?;

                let result = match build(&self.client).timeout(self.timeout).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        resp.text().await.map_err(FetchError::Request)
                    }
                    Ok(resp) => Err(FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    }),
                    Err(err) => Err(FetchError::Request(err)),
                };

                match result {
                    Ok(body) => return Ok(body),
                    Err(err) if err.is_retryable() && attempt < self.backoff.max_attempts => {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        tracing::warn!(attempt, ?delay, error = %err, "retrying request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl ByteSource for HttpFetcher {
    async fn open(&self, url: &str) -> Result<ByteStream, FetchError> {
        let permit = self
            .global_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Stream("fetcher shut down".to_string()))?;

        let span = info_span!("http_fetch", url);
        let resp = tokio::time::timeout(self.timeout, self.client.get(url).send())
            .instrument(span)
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.to_string(),
            })??;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        // The permit rides along with the stream so the body read counts against the limit.
        let stream = resp.bytes_stream().map(move |chunk| {
            let _held = &permit;
            chunk.map_err(FetchError::Request)
        });
        Ok(with_idle_timeout(stream.boxed(), self.timeout, url.to_string()))
    }
}

/// End `inner` with `FetchError::Timeout` when no chunk arrives within `idle`.
/// A stalled body otherwise holds its permit and claim forever.
fn with_idle_timeout(inner: ByteStream, idle: Duration, url: String) -> ByteStream {
    futures::stream::unfold(Some(inner), move |state| {
        let url = url.clone();
        async move {
            let mut inner = state?;
            match tokio::time::timeout(idle, inner.next()).await {
                Ok(Some(item)) => Some((item, Some(inner))),
                Ok(None) => None,
                Err(_) => {
                    tracing::warn!(url = %url, ?idle, "response body stalled");
                    Some((Err(FetchError::Timeout { url }), None))
                }
            }
        }
    })
    .boxed()
}
