//! Core domain model for posfeed: file claims, ingested rows, backups and fetch jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod events;
pub mod normalize;

pub use events::{EventBus, JobEvent, JobSubscription};
pub use normalize::{fingerprint, normalize_row, normalize_value};

pub const CRATE_NAME: &str = "posfeed-core";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown file status `{0}`")]
    UnknownFileStatus(String),
    #[error("unknown job status `{0}`")]
    UnknownJobStatus(String),
    #[error("unknown job mode `{0}`")]
    UnknownJobMode(String),
    #[error("unknown dedupe policy `{0}` (expected `skip` or `replace`)")]
    UnknownDedupePolicy(String),
}

/// Identity of one remote export: a single source file for a terminal on a business date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileIdentity {
    pub branch: String,
    pub pos: u32,
    pub work_date: NaiveDate,
    pub source_file: String,
}

impl FileIdentity {
    pub fn new(
        branch: impl Into<String>,
        pos: u32,
        work_date: NaiveDate,
        source_file: impl Into<String>,
    ) -> Self {
        Self {
            branch: branch.into(),
            pos,
            work_date,
            source_file: source_file.into(),
        }
    }

    /// Base filename of the source, without any URL query or fragment.
    pub fn filename(&self) -> String {
        let trimmed = self
            .source_file
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');
        let name = trimmed.rsplit(['/', '\\']).next().unwrap_or_default();
        if name.is_empty() {
            "download.csv".to_string()
        } else {
            name.to_string()
        }
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.branch, self.pos, self.work_date, self.source_file
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Raw,
    Processing,
    Completed,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Raw => "raw",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Error => "error",
        }
    }
}

impl FromStr for FileStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(FileStatus::Raw),
            "processing" => Ok(FileStatus::Processing),
            "completed" => Ok(FileStatus::Completed),
            "error" => Ok(FileStatus::Error),
            other => Err(CoreError::UnknownFileStatus(other.to_string())),
        }
    }
}

/// Persistent claim/status record for one [`FileIdentity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub identity: FileIdentity,
    pub filename: String,
    pub storage_path: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub checksum: Option<String>,
    pub status: FileStatus,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn processing(identity: FileIdentity, now: DateTime<Utc>) -> Self {
        Self {
            filename: identity.filename(),
            identity,
            storage_path: None,
            fetched_at: Some(now),
            size: None,
            checksum: None,
            status: FileStatus::Processing,
            error: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// What a successful download left behind, stamped onto the claim on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedFile {
    pub storage_path: String,
    pub size: u64,
    pub checksum: String,
}

/// Result of one atomic claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimOutcome {
    /// The caller now owns the identity. `reclaimed` is true when an existing
    /// record (completed, errored or reset) was flipped back to processing.
    Claimed { reclaimed: bool },
    /// Completed earlier and the policy is `skip`.
    AlreadyCompleted,
    /// Another worker currently holds the claim.
    InProgress,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupePolicy {
    #[default]
    Skip,
    Replace,
}

impl DedupePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupePolicy::Skip => "skip",
            DedupePolicy::Replace => "replace",
        }
    }
}

impl FromStr for DedupePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" | "" => Ok(DedupePolicy::Skip),
            "replace" => Ok(DedupePolicy::Replace),
            other => Err(CoreError::UnknownDedupePolicy(other.to_string())),
        }
    }
}

/// Scalar value held in a dynamic row field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Number(_) | FieldValue::Date(_) => false,
        }
    }

    /// Render the value the way it would appear in a CSV cell.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Date(d) => d.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// Header-keyed field map in source column order. Source headers vary by branch
/// and era, so rows stay dynamic.
pub type FieldMap = IndexMap<String, FieldValue>;

/// One persisted transaction row ("report").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedRow {
    pub id: Uuid,
    pub job_id: String,
    pub branch: String,
    pub pos: u32,
    pub work_date: NaiveDate,
    pub source_file: String,
    pub ingested_at: DateTime<Utc>,
    pub unique_key: Option<String>,
    pub data: FieldMap,
}

impl IngestedRow {
    /// Attach job and identity metadata to a normalized field map and derive its fingerprint.
    pub fn from_fields(
        job_id: &str,
        identity: &FileIdentity,
        data: FieldMap,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        let unique_key = fingerprint(&data, Some(&identity.branch), Some(identity.pos));
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.to_string(),
            branch: identity.branch.clone(),
            pos: identity.pos,
            work_date: identity.work_date,
            source_file: identity.source_file.clone(),
            ingested_at,
            unique_key,
            data,
        }
    }

    pub fn identity(&self) -> FileIdentity {
        FileIdentity::new(
            self.branch.clone(),
            self.pos,
            self.work_date,
            self.source_file.clone(),
        )
    }
}

/// Copy of a row taken right before a `replace` overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBackup {
    pub original_id: Uuid,
    pub row: IngestedRow,
    pub replaced_at: DateTime<Utc>,
    pub replaced_by_job: String,
    pub created_at: DateTime<Utc>,
}

impl ReportBackup {
    pub fn of(row: IngestedRow, replaced_by_job: &str, now: DateTime<Utc>) -> Self {
        Self {
            original_id: row.id,
            row,
            replaced_at: now,
            replaced_by_job: replaced_by_job.to_string(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CoreError::UnknownJobStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobMode {
    Range,
    Missing,
    Files,
    FromLog,
    Combine,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Range => "range",
            JobMode::Missing => "missing",
            JobMode::Files => "files",
            JobMode::FromLog => "from-log",
            JobMode::Combine => "combine",
        }
    }
}

impl FromStr for JobMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "range" => Ok(JobMode::Range),
            "missing" => Ok(JobMode::Missing),
            "files" => Ok(JobMode::Files),
            "from-log" => Ok(JobMode::FromLog),
            "combine" => Ok(JobMode::Combine),
            other => Err(CoreError::UnknownJobMode(other.to_string())),
        }
    }
}

/// Fetch job log. `errors` is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchLog {
    pub job_id: String,
    pub status: JobStatus,
    pub mode: JobMode,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub branches: Vec<String>,
    pub positions: Vec<u32>,
    pub rows_inserted: u64,
    pub files_total: u64,
    pub files_completed: u64,
    pub errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FetchLog {
    pub fn queued(job_id: impl Into<String>, mode: JobMode, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Queued,
            mode,
            start_date: None,
            end_date: None,
            branches: Vec::new(),
            positions: Vec::new(),
            rows_inserted: 0,
            files_total: 0,
            files_completed: 0,
            errors: Vec::new(),
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A remote file to ingest, with the identity it will be claimed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTarget {
    pub url: String,
    pub identity: FileIdentity,
}

/// Job ids are the submission time in epoch milliseconds.
pub fn new_job_id(now: DateTime<Utc>) -> String {
    now.timestamp_millis().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn identity_filename_strips_url_and_query() {
        let id = FileIdentity::new(
            "AYALA-FRN",
            1,
            date("2025-07-01"),
            "https://pos.example.com/files/a_AYALA-FRN_1_rd5000_2025-07-01_.csv?token=x",
        );
        assert_eq!(id.filename(), "a_AYALA-FRN_1_rd5000_2025-07-01_.csv");

        let bare = FileIdentity::new("B", 2, date("2025-07-01"), "report.csv");
        assert_eq!(bare.filename(), "report.csv");

        let empty = FileIdentity::new("B", 2, date("2025-07-01"), "https://host/");
        assert_eq!(empty.filename(), "host");
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in [
            FileStatus::Raw,
            FileStatus::Processing,
            FileStatus::Completed,
            FileStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<FileStatus>().unwrap(), status);
        }
        assert!("done".parse::<FileStatus>().is_err());
        assert_eq!("from-log".parse::<JobMode>().unwrap(), JobMode::FromLog);
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn dedupe_policy_defaults_to_skip() {
        assert_eq!(DedupePolicy::default(), DedupePolicy::Skip);
        assert_eq!("REPLACE".parse::<DedupePolicy>().unwrap(), DedupePolicy::Replace);
        assert_eq!("".parse::<DedupePolicy>().unwrap(), DedupePolicy::Skip);
        assert!("overwrite".parse::<DedupePolicy>().is_err());
    }

    #[test]
    fn field_values_serialize_as_plain_scalars() {
        let mut map = FieldMap::new();
        map.insert("OR".into(), FieldValue::Text("00012".into()));
        map.insert("QTY".into(), FieldValue::Number(2.0));
        map.insert("NOTE".into(), FieldValue::Null);
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["OR"], "00012");
        assert_eq!(json["QTY"], 2.0);
        assert!(json["NOTE"].is_null());
    }

    #[test]
    fn rows_pick_up_fingerprint_from_identity() {
        let id = FileIdentity::new("BR", 3, date("2025-07-02"), "f.csv");
        let mut data = FieldMap::new();
        data.insert("OR".into(), "555".into());
        data.insert("TIME".into(), "10:01".into());
        data.insert("ITEM_CODE".into(), "X1".into());
        let row = IngestedRow::from_fields("job-1", &id, data, Utc::now());
        assert_eq!(row.unique_key.as_deref(), Some("BR|3|555|10:01|X1"));
        assert_eq!(row.identity(), id);
    }
}
