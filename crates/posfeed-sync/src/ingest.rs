//! Streaming ingest of one remote export.
//!
//! The byte stream is teed: every chunk goes to the on-disk artifact (hashed as it is
//! written) and, through a bounded channel, to a CSV parser on a blocking thread. Parsed
//! rows come back through a second bounded channel and are batch-inserted. A slow
//! consumer on either side stalls the download instead of growing a buffer.

use std::io::{self, Read};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use chrono::Utc;
use futures::StreamExt;
use posfeed_core::{
    normalize_row, ClaimOutcome, CompletedFile, DedupePolicy, EventBus, FieldMap, FieldValue,
    FileTarget, IngestedRow, JobEvent,
};
use posfeed_storage::{
    ArtifactStore, ArtifactWriter, BackoffPolicy, BatchWriter, ByteSource, ByteStream, FetchError,
    FlushReport, RetryDisposition, Store, StoreError, StoredArtifact,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::claims::ClaimTracker;

/// Downloaded chunks buffered ahead of the parser.
pub const BYTE_CHANNEL_CAPACITY: usize = 32;
/// Parsed rows buffered ahead of the inserter.
pub const ROW_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("csv parse failed for {file}: {message}")]
    Parse { file: String, message: String },
    #[error("artifact write failed: {0:#}")]
    Artifact(anyhow::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("parser task failed: {0}")]
    Worker(String),
}

impl IngestError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            IngestError::Fetch(err) => err.disposition(),
            // Only io failures abort the parser, and those come from the byte stream.
            IngestError::Parse { .. } => RetryDisposition::Retryable,
            IngestError::Artifact(_) | IngestError::Store(_) | IngestError::Worker(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Ingested {
        rows: u64,
        rejected: u64,
        file: CompletedFile,
    },
    /// The claim was refused.
    Skipped(ClaimOutcome),
}

impl IngestOutcome {
    pub fn rows(&self) -> u64 {
        match self {
            IngestOutcome::Ingested { rows, .. } => *rows,
            IngestOutcome::Skipped(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub batch_size: usize,
    pub dedupe: DedupePolicy,
    pub backoff: BackoffPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            dedupe: DedupePolicy::Skip,
            backoff: BackoffPolicy::default(),
        }
    }
}

pub struct StreamIngestor {
    store: Arc<dyn Store>,
    source: Arc<dyn ByteSource>,
    artifacts: ArtifactStore,
    claims: ClaimTracker,
    events: EventBus,
    options: IngestOptions,
}

impl StreamIngestor {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn ByteSource>,
        artifacts: ArtifactStore,
        events: EventBus,
        options: IngestOptions,
    ) -> Self {
        Self {
            claims: ClaimTracker::new(store.clone(), options.dedupe),
            store,
            source,
            artifacts,
            events,
            options,
        }
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    /// Claim, download, parse and store one file.
    ///
    /// A refused claim emits a skip event and returns zero rows. Any failure after the
    /// claim is recorded on the claim before it is returned.
    pub async fn ingest(
        &self,
        job_id: &str,
        target: &FileTarget,
    ) -> Result<IngestOutcome, IngestError> {
        let identity = &target.identity;
        let span = info_span!(
            "ingest_file",
            job_id,
            branch = %identity.branch,
            pos = identity.pos,
            work_date = %identity.work_date,
            source_file = %identity.source_file,
        );
        async {
            let claim = self.claims.claim(identity).await?;
            if !claim.is_claimed() {
                let reason = match claim {
                    ClaimOutcome::AlreadyCompleted => "already completed",
                    _ => "claimed by another worker",
                };
                info!(reason, "skipping file");
                self.events.publish(JobEvent::Skipped {
                    job_id: job_id.to_string(),
                    file: target.url.clone(),
                    reason: reason.to_string(),
                });
                return Ok(IngestOutcome::Skipped(claim));
            }

            match self.download(job_id, target).await {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    if let Err(mark) = self.claims.fail(identity, &err.to_string()).await {
                        warn!(error = %mark, "could not record claim failure");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn download(
        &self,
        job_id: &str,
        target: &FileTarget,
    ) -> Result<IngestOutcome, IngestError> {
        let identity = &target.identity;
        if self.options.dedupe == DedupePolicy::Replace {
            // Old rows go before any new row lands under the same identity.
            let moved = self
                .store
                .backup_and_delete(identity, job_id, Utc::now())
                .await?;
            if moved > 0 {
                info!(moved, "backed up prior rows before replace");
            }
        }

        let backoff = self.options.backoff;
        let mut attempt = 1;
        loop {
            let mut batch = BatchWriter::new(self.store.clone(), self.options.batch_size);
            match self.attempt(job_id, target, &mut batch).await {
                Ok(artifact) => {
                    let totals = batch.totals();
                    let file = CompletedFile {
                        storage_path: artifact.relative_path.to_string_lossy().into_owned(),
                        size: artifact.byte_size,
                        checksum: artifact.content_hash,
                    };
                    self.claims.complete(identity, &file).await?;
                    info!(
                        rows = totals.inserted,
                        rejected = totals.rejected,
                        attempt,
                        "file ingested"
                    );
                    return Ok(IngestOutcome::Ingested {
                        rows: totals.inserted,
                        rejected: totals.rejected,
                        file,
                    });
                }
                Err(err) => {
                    // Rows already stored are not rolled back, so only a clean failure is retried.
                    let inserted = batch.totals().inserted;
                    if inserted == 0 && err.is_retryable() && attempt < backoff.max_attempts {
                        let delay = backoff.delay_for_attempt(attempt);
                        warn!(attempt, ?delay, error = %err, "ingest attempt failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    warn!(attempt, inserted, error = %err, "ingest failed");
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        job_id: &str,
        target: &FileTarget,
        batch: &mut BatchWriter,
    ) -> Result<StoredArtifact, IngestError> {
        let stream = self.source.open(&target.url).await?;
        let relative = self.artifacts.artifact_relative_path(&target.identity);
        let mut writer = self
            .artifacts
            .begin(relative)
            .await
            .map_err(IngestError::Artifact)?;

        let (bytes_tx, bytes_rx) = mpsc::channel(BYTE_CHANNEL_CAPACITY);
        let (rows_tx, rows_rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let file = target.identity.source_file.clone();
        let parser = tokio::task::spawn_blocking(move || {
            parse_rows(ChannelReader::new(bytes_rx), &file, rows_tx)
        });

        let (pumped, inserted) = tokio::join!(
            pump(stream, &mut writer, bytes_tx),
            self.insert_rows(job_id, target, rows_rx, batch),
        );
        let parsed = parser
            .await
            .map_err(|e| IngestError::Worker(e.to_string()))
            .and_then(|result| result);

        let finished = async {
            let rows = pumped.and(inserted).and(parsed)?;
            // The remainder is only stored once the whole file parsed.
            if let Some(report) = batch.finish().await? {
                self.publish_progress(job_id, target, report);
            }
            Ok::<u64, IngestError>(rows)
        }
        .await;

        match finished {
            Ok(rows) => {
                let artifact = writer.finish().await.map_err(IngestError::Artifact)?;
                debug!(rows, bytes = artifact.byte_size, checksum = %artifact.content_hash, "download finished");
                Ok(artifact)
            }
            Err(err) => {
                writer.abort().await;
                Err(err)
            }
        }
    }

    /// Push full batches as rows arrive. Owning `rx` means an early return unblocks the parser.
    async fn insert_rows(
        &self,
        job_id: &str,
        target: &FileTarget,
        mut rx: mpsc::Receiver<FieldMap>,
        batch: &mut BatchWriter,
    ) -> Result<(), IngestError> {
        while let Some(data) = rx.recv().await {
            let row = IngestedRow::from_fields(job_id, &target.identity, data, Utc::now());
            if let Some(report) = batch.push(row).await? {
                self.publish_progress(job_id, target, report);
            }
        }
        Ok(())
    }

    fn publish_progress(&self, job_id: &str, target: &FileTarget, report: FlushReport) {
        self.events.publish(JobEvent::Progress {
            job_id: job_id.to_string(),
            file: target.url.clone(),
            batch_rows: report.batch_rows,
            total_rows: report.total_rows,
        });
    }
}

/// Copy the download into the artifact writer and the parser channel.
async fn pump(
    mut stream: ByteStream,
    writer: &mut ArtifactWriter,
    tx: mpsc::Sender<io::Result<Bytes>>,
) -> Result<(), IngestError> {
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx.send(Err(io::Error::other(err.to_string()))).await;
                return Err(err.into());
            }
        };
        if let Err(err) = writer.write_chunk(&chunk).await {
            let _ = tx
                .send(Err(io::Error::other("artifact write failed")))
                .await;
            return Err(IngestError::Artifact(err));
        }
        if tx.send(Ok(chunk)).await.is_err() {
            debug!("parser stopped reading");
            break;
        }
    }
    Ok(())
}

/// Blocking `Read` over the chunks sent by [`pump`].
struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Header-keyed parse of the teed stream. Malformed rows are logged and skipped.
fn parse_rows<R: Read>(
    reader: R,
    file: &str,
    tx: mpsc::Sender<FieldMap>,
) -> Result<u64, IngestError> {
    let parse_error = |err: csv::Error| IngestError::Parse {
        file: file.to_string(),
        message: err.to_string(),
    };
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = csv
        .byte_headers()
        .map_err(parse_error)?
        .iter()
        .map(|h| String::from_utf8_lossy(h).into_owned())
        .collect();

    let mut parsed = 0u64;
    for (index, result) in csv.byte_records().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(err) if err.is_io_error() => return Err(parse_error(err)),
            Err(err) => {
                warn!(file, row = index + 1, error = %err, "skipping malformed row");
                continue;
            }
        };
        let fields = headers.iter().zip(record.iter()).map(|(header, value)| {
            (
                header.clone(),
                FieldValue::Text(String::from_utf8_lossy(value).into_owned()),
            )
        });
        if tx.blocking_send(normalize_row(fields)).is_err() {
            debug!(file, "row consumer stopped early");
            break;
        }
        parsed += 1;
    }
    Ok(parsed)
}
