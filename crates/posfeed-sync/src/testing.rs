//! In-memory byte source and a store with a broken job table, for pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use posfeed_core::{
    ClaimOutcome, CompletedFile, DedupePolicy, FetchLog, FileIdentity, FileRecord, IngestedRow,
    JobStatus,
};
use posfeed_storage::{
    ByteSource, ByteStream, ClaimRepo, FetchError, InsertOutcome, JobRepo, MemoryStore,
    ReportFilter, ReportPage, ReportRepo, StoreError, StoreResult,
};

pub struct MemorySource {
    files: Mutex<HashMap<String, Vec<u8>>>,
    timeouts: Mutex<HashMap<String, usize>>,
    truncations: Mutex<HashMap<String, usize>>,
    opens: AtomicUsize,
    chunk_size: usize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            timeouts: Mutex::new(HashMap::new()),
            truncations: Mutex::new(HashMap::new()),
            opens: AtomicUsize::new(0),
            chunk_size: 64,
        }
    }

    pub fn with_file(self, url: &str, body: &str) -> Self {
        self.set_file(url, body);
        self
    }

    pub fn chunked(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn set_file(&self, url: &str, body: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(url.to_string(), body.as_bytes().to_vec());
    }

    /// The next `n` opens of `url` time out.
    pub fn fail_next(&self, url: &str, n: usize) {
        self.timeouts.lock().unwrap().insert(url.to_string(), n);
    }

    /// The next `n` opens of `url` break after the first chunk.
    pub fn truncate_next(&self, url: &str, n: usize) {
        self.truncations.lock().unwrap().insert(url.to_string(), n);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn take(counter: &Mutex<HashMap<String, usize>>, url: &str) -> bool {
        let mut counter = counter.lock().unwrap();
        match counter.get_mut(url) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn open(&self, url: &str) -> Result<ByteStream, FetchError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.timeouts, url) {
            return Err(FetchError::Timeout {
                url: url.to_string(),
            });
        }
        let body = self
            .files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(url.to_string()))?;

        let mut chunks: Vec<Result<Bytes, FetchError>> = body
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if Self::take(&self.truncations, url) {
            chunks.truncate(1);
            chunks.push(Err(FetchError::Stream("connection reset".into())));
        }
        Ok(stream::iter(chunks).boxed())
    }
}

/// Delegates to a `MemoryStore`, except that every job-log write after
/// `mark_job_running` fails.
pub struct JobLogOutage {
    pub inner: Arc<MemoryStore>,
    pub failed_writes: AtomicUsize,
}

impl JobLogOutage {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failed_writes: AtomicUsize::new(0),
        }
    }

    fn outage(&self) -> StoreError {
        self.failed_writes.fetch_add(1, Ordering::SeqCst);
        StoreError::Corrupt("job table unavailable".into())
    }
}

#[async_trait]
impl ClaimRepo for JobLogOutage {
    async fn claim_file(
        &self,
        identity: &FileIdentity,
        policy: DedupePolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        self.inner.claim_file(identity, policy, now).await
    }

    async fn complete_file(
        &self,
        identity: &FileIdentity,
        file: &CompletedFile,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner.complete_file(identity, file, now).await
    }

    async fn fail_file(
        &self,
        identity: &FileIdentity,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner.fail_file(identity, error, now).await
    }

    async fn reset_file(&self, identity: &FileIdentity, now: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.reset_file(identity, now).await
    }

    async fn find_file(&self, identity: &FileIdentity) -> StoreResult<Option<FileRecord>> {
        self.inner.find_file(identity).await
    }

    async fn distinct_branches(&self) -> StoreResult<Vec<String>> {
        self.inner.distinct_branches().await
    }
}

#[async_trait]
impl ReportRepo for JobLogOutage {
    async fn insert_reports(&self, rows: &[IngestedRow]) -> StoreResult<InsertOutcome> {
        self.inner.insert_reports(rows).await
    }

    async fn count_reports(&self, filter: &ReportFilter) -> StoreResult<u64> {
        self.inner.count_reports(filter).await
    }

    async fn find_reports(
        &self,
        filter: &ReportFilter,
        page: u64,
        limit: u64,
    ) -> StoreResult<ReportPage> {
        self.inner.find_reports(filter, page, limit).await
    }

    async fn backup_and_delete(
        &self,
        identity: &FileIdentity,
        replaced_by_job: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.inner.backup_and_delete(identity, replaced_by_job, now).await
    }

    async fn count_backups(&self, created_before: Option<DateTime<Utc>>) -> StoreResult<u64> {
        self.inner.count_backups(created_before).await
    }

    async fn delete_backups_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.delete_backups_before(cutoff).await
    }
}

#[async_trait]
impl JobRepo for JobLogOutage {
    async fn create_job(&self, log: &FetchLog) -> StoreResult<bool> {
        self.inner.create_job(log).await
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<FetchLog>> {
        self.inner.get_job(job_id).await
    }

    async fn mark_job_running(
        &self,
        job_id: &str,
        files_total: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner.mark_job_running(job_id, files_total, now).await
    }

    async fn update_job_progress(
        &self,
        _job_id: &str,
        _rows_inserted: u64,
        _files_completed: u64,
        _now: DateTime<Utc>,
    ) -> StoreResult<()> {
        Err(self.outage())
    }

    async fn append_job_error(
        &self,
        _job_id: &str,
        _message: &str,
        _now: DateTime<Utc>,
    ) -> StoreResult<()> {
        Err(self.outage())
    }

    async fn finish_job(
        &self,
        _job_id: &str,
        _status: JobStatus,
        _now: DateTime<Utc>,
    ) -> StoreResult<()> {
        Err(self.outage())
    }
}
