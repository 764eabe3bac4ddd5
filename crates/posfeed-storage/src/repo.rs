//! Persistence seams: file claims, report rows, backups and job logs.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use posfeed_core::{
    ClaimOutcome, CompletedFile, DedupePolicy, FetchLog, FileIdentity, FileRecord, IngestedRow,
    JobStatus,
};
use thiserror::Error;

/// Largest page `find_reports` will return.
pub const MAX_PAGE_SIZE: u64 = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job `{0}` not found")]
    JobNotFound(String),
    #[error("no processing claim held for {0}")]
    ClaimNotHeld(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Bulk insert tally. Rows rejected by the unique key are counted, not raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub rejected: u64,
}

impl InsertOutcome {
    pub fn absorb(&mut self, other: InsertOutcome) {
        self.inserted += other.inserted;
        self.rejected += other.rejected;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportFilter {
    pub branch: Option<String>,
    pub pos: Option<u32>,
    pub work_date: Option<NaiveDate>,
    pub source_file: Option<String>,
    pub job_id: Option<String>,
}

impl ReportFilter {
    pub fn for_identity(identity: &FileIdentity) -> Self {
        Self {
            branch: Some(identity.branch.clone()),
            pos: Some(identity.pos),
            work_date: Some(identity.work_date),
            source_file: Some(identity.source_file.clone()),
            job_id: None,
        }
    }

    pub fn matches(&self, row: &IngestedRow) -> bool {
        self.branch.as_deref().map_or(true, |b| b == row.branch)
            && self.pos.map_or(true, |p| p == row.pos)
            && self.work_date.map_or(true, |d| d == row.work_date)
            && self
                .source_file
                .as_deref()
                .map_or(true, |s| s == row.source_file)
            && self.job_id.as_deref().map_or(true, |j| j == row.job_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportPage {
    pub items: Vec<IngestedRow>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

/// Clamp a 1-based page request to sane bounds.
pub fn page_window(page: u64, limit: u64) -> (u64, u64) {
    let page = page.max(1);
    let limit = limit.clamp(1, MAX_PAGE_SIZE);
    (page, limit)
}

#[async_trait]
pub trait ClaimRepo: Send + Sync {
    /// Atomically claim `identity` for processing. At most one caller wins.
    async fn claim_file(
        &self,
        identity: &FileIdentity,
        policy: DedupePolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome>;

    /// processing -> completed.
    async fn complete_file(
        &self,
        identity: &FileIdentity,
        file: &CompletedFile,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// processing -> error.
    async fn fail_file(
        &self,
        identity: &FileIdentity,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Manual recovery: processing or error -> raw. Returns whether anything changed.
    async fn reset_file(&self, identity: &FileIdentity, now: DateTime<Utc>) -> StoreResult<bool>;

    async fn find_file(&self, identity: &FileIdentity) -> StoreResult<Option<FileRecord>>;

    async fn distinct_branches(&self) -> StoreResult<Vec<String>>;
}

#[async_trait]
pub trait ReportRepo: Send + Sync {
    /// Unordered bulk insert. Duplicate fingerprints are rejected individually.
    async fn insert_reports(&self, rows: &[IngestedRow]) -> StoreResult<InsertOutcome>;

    async fn count_reports(&self, filter: &ReportFilter) -> StoreResult<u64>;

    async fn find_reports(
        &self,
        filter: &ReportFilter,
        page: u64,
        limit: u64,
    ) -> StoreResult<ReportPage>;

    /// Copy every row of `identity` into backups, then delete the originals.
    async fn backup_and_delete(
        &self,
        identity: &FileIdentity,
        replaced_by_job: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn count_backups(&self, created_before: Option<DateTime<Utc>>) -> StoreResult<u64>;

    async fn delete_backups_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Insert-if-absent. Returns false when the job id already exists.
    async fn create_job(&self, log: &FetchLog) -> StoreResult<bool>;

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<FetchLog>>;

    async fn mark_job_running(
        &self,
        job_id: &str,
        files_total: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn update_job_progress(
        &self,
        job_id: &str,
        rows_inserted: u64,
        files_completed: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn append_job_error(
        &self,
        job_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;
}

pub trait Store: ClaimRepo + ReportRepo + JobRepo {}

impl<T: ClaimRepo + ReportRepo + JobRepo> Store for T {}
