//! Job submission and execution.
//!
//! `submit` resolves a request into concrete work and records a queued job log;
//! `run` processes that work one file (or combine group) at a time, keeping the log and
//! the event bus current. File-level failures land in the job's error list and the run
//! moves on; only a persistence failure aborts the job.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use posfeed_combine::{group_workdir, CombineOptions, Combiner, ExportName};
use posfeed_core::{
    new_job_id, EventBus, FetchLog, FileIdentity, FileTarget, JobEvent, JobMode, JobStatus,
};
use posfeed_storage::{ArtifactStore, HttpFetcher, Store, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::ingest::{IngestOptions, IngestOutcome, StreamIngestor};
use crate::last_record::{read_last_record, write_last_record};
use crate::listing::{
    resolve_file_url, resolve_listed, FileLister, HttpLister, ListingConfig, ListingRequest,
};
use crate::registry::BranchRegistry;

const MANIFEST_DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y%m%d"];
/// Attempts at finding a free job id when two submissions share a millisecond.
const JOB_ID_ATTEMPTS: i64 = 16;

/// What a caller asks for. Empty branch or position lists fall back to the defaults.
#[derive(Debug, Clone, PartialEq)]
pub enum JobSubmission {
    Range {
        start: NaiveDate,
        end: NaiveDate,
        branches: Vec<String>,
        positions: Vec<u32>,
    },
    Missing {
        branches_missing: BTreeMap<String, BTreeMap<u32, Vec<NaiveDate>>>,
    },
    Files {
        files: Vec<FileManifestEntry>,
    },
    /// From the date in the last-record log up to `end`, yesterday when unset.
    FromLog {
        end: Option<NaiveDate>,
        branches: Vec<String>,
        positions: Vec<u32>,
    },
    Combine {
        workdir: Option<PathBuf>,
    },
}

impl JobSubmission {
    pub fn mode(&self) -> JobMode {
        match self {
            JobSubmission::Range { .. } => JobMode::Range,
            JobSubmission::Missing { .. } => JobMode::Missing,
            JobSubmission::Files { .. } => JobMode::Files,
            JobSubmission::FromLog { .. } => JobMode::FromLog,
            JobSubmission::Combine { .. } => JobMode::Combine,
        }
    }
}

/// One entry of an explicit file manifest. Fields left out are read from the export
/// name (`<prefix>_<branch>_<pos>_<type>_<date>_...csv`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileManifestEntry {
    pub url: String,
    pub branch: Option<String>,
    pub pos: Option<u32>,
    #[serde(alias = "date")]
    pub work_date: Option<NaiveDate>,
    pub source_file: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("job {job_id}: no files resolved")]
    NoFiles { job_id: String },
    #[error("no listing endpoint configured")]
    ListingNotConfigured,
    #[error("last-record log {} holds no date", .0.display())]
    NoLastRecord(PathBuf),
    #[error("invalid date range {start}..{end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub enum JobWork {
    Files(Vec<FileTarget>),
    Combine(CombineOptions),
}

/// A submitted job, ready for `JobRunner::run`.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub mode: JobMode,
    pub work: JobWork,
    /// Written with today's date once the job completes.
    pub log_update: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub mode: JobMode,
    pub status: JobStatus,
    pub files_total: u64,
    pub files_completed: u64,
    /// Included in `files_completed`.
    pub files_skipped: u64,
    pub rows_inserted: u64,
    pub errors: Vec<String>,
}

impl JobSummary {
    fn start(job: &QueuedJob, files_total: u64) -> Self {
        Self {
            job_id: job.job_id.clone(),
            mode: job.mode,
            status: JobStatus::Running,
            files_total,
            files_completed: 0,
            files_skipped: 0,
            rows_inserted: 0,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub branches: Vec<String>,
    pub positions: Vec<u32>,
    pub last_record_log: PathBuf,
    pub combine: CombineOptions,
    pub listing: ListingConfig,
}

pub struct JobRunner {
    store: Arc<dyn Store>,
    ingestor: StreamIngestor,
    lister: Option<Arc<dyn FileLister>>,
    events: EventBus,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn Store>,
        ingestor: StreamIngestor,
        lister: Option<Arc<dyn FileLister>>,
        events: EventBus,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            ingestor,
            lister,
            events,
            settings,
        }
    }

    /// Wire the HTTP fetcher, listing endpoint, branch registry and combiner from config.
    pub fn from_config(
        config: &SyncConfig,
        store: Arc<dyn Store>,
        events: EventBus,
    ) -> anyhow::Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let registry = BranchRegistry::load_or_default(&config.registry_path())?;
        let listing = config.listing();
        let lister = HttpLister::from_config(fetcher.clone(), &listing)
            .map(|lister| Arc::new(lister) as Arc<dyn FileLister>);

        let ingestor = StreamIngestor::new(
            store.clone(),
            fetcher,
            ArtifactStore::new(&config.artifacts_dir),
            events.clone(),
            IngestOptions {
                batch_size: config.batch_size,
                dedupe: config.dedupe,
                backoff: config.backoff(),
            },
        );

        let mut combine = CombineOptions::new(&config.artifacts_dir, &config.combine_out);
        combine.header_template = Some(config.header_template.clone());
        combine.batch_size = config.batch_size;
        combine.new_branches = registry.new_branches();

        let branches = if config.branches.is_empty() {
            registry.enabled_branches()
        } else {
            config.branches.clone()
        };

        Ok(Self::new(
            store,
            ingestor,
            lister,
            events,
            RunnerSettings {
                branches,
                positions: config.positions.clone(),
                last_record_log: config.last_record_log.clone(),
                combine,
                listing,
            },
        ))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Resolve the request and record a queued job log.
    ///
    /// A file job that resolves nothing is recorded as failed and returns `NoFiles`.
    pub async fn submit(&self, submission: JobSubmission) -> Result<QueuedJob, SubmitError> {
        let now = Utc::now();
        let mode = submission.mode();
        let mut log = FetchLog::queued(new_job_id(now), mode, now);
        let mut log_update = None;

        let targets = match submission {
            JobSubmission::Combine { workdir } => {
                let mut options = self.settings.combine.clone();
                if let Some(workdir) = workdir {
                    options.workdir = workdir;
                }
                let log = self.create_log(log).await?;
                info!(job_id = %log.job_id, workdir = %options.workdir.display(), "combine job queued");
                return Ok(QueuedJob {
                    job_id: log.job_id,
                    mode,
                    work: JobWork::Combine(options),
                    log_update: None,
                });
            }
            JobSubmission::Range {
                start,
                end,
                branches,
                positions,
            } => self.resolve_range(&mut log, start, end, branches, positions).await?,
            JobSubmission::FromLog {
                end,
                branches,
                positions,
            } => {
                let path = self.settings.last_record_log.clone();
                let start =
                    read_last_record(&path)?.ok_or_else(|| SubmitError::NoLastRecord(path.clone()))?;
                let end = end.unwrap_or_else(|| Utc::now().date_naive() - Duration::days(1));
                log_update = Some(path);
                self.resolve_range(&mut log, start, end, branches, positions).await?
            }
            JobSubmission::Missing { branches_missing } => {
                let lister = self.lister()?;
                let mut dates = Vec::new();
                let mut requests = Vec::new();
                for (branch, by_pos) in &branches_missing {
                    log.branches.push(branch.clone());
                    for (pos, missing) in by_pos {
                        if !log.positions.contains(pos) {
                            log.positions.push(*pos);
                        }
                        for date in missing {
                            dates.push(*date);
                            requests.push(ListingRequest {
                                branch: branch.clone(),
                                pos: *pos,
                                date: *date,
                            });
                        }
                    }
                }
                log.positions.sort_unstable();
                log.start_date = dates.iter().min().copied();
                log.end_date = dates.iter().max().copied();
                let resolved = resolve_listed(lister, &self.settings.listing, requests).await;
                log.errors.extend(resolved.errors);
                resolved.targets
            }
            JobSubmission::Files { files } => {
                let mut targets = Vec::new();
                for entry in &files {
                    match manifest_target(entry, &self.settings.listing) {
                        Ok(target) => targets.push(target),
                        Err(message) => {
                            warn!(url = %entry.url, %message, "manifest entry skipped");
                            log.errors.push(message);
                        }
                    }
                }
                let mut branches: Vec<String> =
                    targets.iter().map(|t| t.identity.branch.clone()).collect();
                branches.sort();
                branches.dedup();
                log.branches = branches;
                log.start_date = targets.iter().map(|t| t.identity.work_date).min();
                log.end_date = targets.iter().map(|t| t.identity.work_date).max();
                targets
            }
        };

        if targets.is_empty() {
            log.status = JobStatus::Failed;
            log.errors.push("no files resolved".to_string());
            log.finished_at = Some(now);
            let log = self.create_log(log).await?;
            warn!(job_id = %log.job_id, mode = mode.as_str(), "no files resolved, job failed");
            return Err(SubmitError::NoFiles { job_id: log.job_id });
        }

        log.files_total = targets.len() as u64;
        let log = self.create_log(log).await?;
        info!(job_id = %log.job_id, mode = mode.as_str(), files = targets.len(), "job queued");
        Ok(QueuedJob {
            job_id: log.job_id,
            mode,
            work: JobWork::Files(targets),
            log_update,
        })
    }

    /// Process a queued job to the end. Only persistence failures surface as `Err`;
    /// the job is marked failed first when that is still possible.
    pub async fn run(&self, job: QueuedJob) -> Result<JobSummary, StoreError> {
        let result = match &job.work {
            JobWork::Files(targets) => self.run_files(&job, targets).await,
            JobWork::Combine(options) => self.run_combine(&job, options.clone()).await,
        };

        match result {
            Ok(summary) => {
                if let (JobStatus::Completed, Some(path)) = (summary.status, &job.log_update) {
                    self.advance_last_record(path);
                }
                info!(
                    job_id = %summary.job_id,
                    status = summary.status.as_str(),
                    files_completed = summary.files_completed,
                    files_total = summary.files_total,
                    rows = summary.rows_inserted,
                    "job finished"
                );
                Ok(summary)
            }
            Err(err) => {
                warn!(job_id = %job.job_id, error = %err, "job aborted on store failure");
                let now = Utc::now();
                if let Err(mark) = self
                    .store
                    .append_job_error(&job.job_id, &err.to_string(), now)
                    .await
                {
                    warn!(job_id = %job.job_id, error = %mark, "could not record job error");
                }
                if let Err(mark) = self.store.finish_job(&job.job_id, JobStatus::Failed, now).await {
                    warn!(job_id = %job.job_id, error = %mark, "could not mark job failed");
                }
                self.events.publish(JobEvent::Error {
                    job_id: job.job_id.clone(),
                    file: None,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_files(
        &self,
        job: &QueuedJob,
        targets: &[FileTarget],
    ) -> Result<JobSummary, StoreError> {
        let job_id = job.job_id.as_str();
        let mut summary = JobSummary::start(job, targets.len() as u64);
        self.store
            .mark_job_running(job_id, summary.files_total, Utc::now())
            .await?;
        self.events.publish(JobEvent::Started {
            job_id: job_id.to_string(),
            message: format!("{} job started, {} files", job.mode.as_str(), targets.len()),
        });

        for target in targets {
            let identity = &target.identity;
            self.events.publish(JobEvent::FileStart {
                job_id: job_id.to_string(),
                branch: identity.branch.clone(),
                pos: identity.pos,
                date: identity.work_date.format("%Y-%m-%d").to_string(),
                file: target.url.clone(),
            });

            match self.ingestor.ingest(job_id, target).await {
                Ok(outcome) => {
                    summary.files_completed += 1;
                    if matches!(outcome, IngestOutcome::Skipped(_)) {
                        summary.files_skipped += 1;
                    }
                    let rows = outcome.rows();
                    summary.rows_inserted += rows;
                    self.store
                        .update_job_progress(
                            job_id,
                            summary.rows_inserted,
                            summary.files_completed,
                            Utc::now(),
                        )
                        .await?;
                    self.events.publish(JobEvent::FileComplete {
                        job_id: job_id.to_string(),
                        file: target.url.clone(),
                        rows,
                        files_completed: summary.files_completed,
                        files_total: summary.files_total,
                    });
                }
                Err(err) => {
                    warn!(job_id, url = %target.url, error = %err, "file failed");
                    let message = format!("{}: {err}", target.url);
                    self.store
                        .append_job_error(job_id, &message, Utc::now())
                        .await?;
                    summary.errors.push(message);
                    self.events.publish(JobEvent::Error {
                        job_id: job_id.to_string(),
                        file: Some(target.url.clone()),
                        message: err.to_string(),
                    });
                }
            }
        }

        self.store
            .finish_job(job_id, JobStatus::Completed, Utc::now())
            .await?;
        summary.status = JobStatus::Completed;
        self.events.publish(JobEvent::Complete {
            job_id: job_id.to_string(),
            rows_inserted: summary.rows_inserted,
            files_completed: summary.files_completed,
            files_total: summary.files_total,
        });
        Ok(summary)
    }

    async fn run_combine(
        &self,
        job: &QueuedJob,
        options: CombineOptions,
    ) -> Result<JobSummary, StoreError> {
        let job_id = job.job_id.as_str();
        let groups_total = group_workdir(&options.workdir)
            .map(|groups| groups.iter().filter(|g| g.transactions().is_some()).count())
            .unwrap_or(0) as u64;
        let mut summary = JobSummary::start(job, groups_total);
        self.store
            .mark_job_running(job_id, groups_total, Utc::now())
            .await?;

        let combiner = Combiner::new(self.store.clone(), self.events.clone(), options);
        match combiner.run(job_id).await {
            Ok(combined) => {
                summary.files_total = combined.groups_total;
                summary.files_completed = combined.groups_completed;
                summary.rows_inserted = combined.rows_inserted;
                self.store
                    .update_job_progress(
                        job_id,
                        combined.rows_inserted,
                        combined.groups_completed,
                        Utc::now(),
                    )
                    .await?;
                for message in &combined.errors {
                    self.store
                        .append_job_error(job_id, message, Utc::now())
                        .await?;
                }
                summary.errors = combined.errors;
                summary.status = JobStatus::Completed;
            }
            Err(err) => {
                let message = err.to_string();
                self.store
                    .append_job_error(job_id, &message, Utc::now())
                    .await?;
                summary.errors.push(message);
                summary.status = JobStatus::Failed;
            }
        }
        self.store
            .finish_job(job_id, summary.status, Utc::now())
            .await?;
        Ok(summary)
    }

    async fn resolve_range(
        &self,
        log: &mut FetchLog,
        start: NaiveDate,
        end: NaiveDate,
        branches: Vec<String>,
        positions: Vec<u32>,
    ) -> Result<Vec<FileTarget>, SubmitError> {
        if start > end {
            return Err(SubmitError::InvalidRange { start, end });
        }
        let lister = self.lister()?;
        let branches = if branches.is_empty() {
            self.settings.branches.clone()
        } else {
            branches
        };
        let positions = if positions.is_empty() {
            self.settings.positions.clone()
        } else {
            positions
        };

        let mut requests = Vec::new();
        for date in start.iter_days().take_while(|d| *d <= end) {
            for branch in &branches {
                for pos in &positions {
                    requests.push(ListingRequest {
                        branch: branch.clone(),
                        pos: *pos,
                        date,
                    });
                }
            }
        }

        log.start_date = Some(start);
        log.end_date = Some(end);
        log.branches = branches;
        log.positions = positions;
        let resolved = resolve_listed(lister, &self.settings.listing, requests).await;
        log.errors.extend(resolved.errors);
        Ok(resolved.targets)
    }

    fn lister(&self) -> Result<&dyn FileLister, SubmitError> {
        self.lister
            .as_deref()
            .ok_or(SubmitError::ListingNotConfigured)
    }

    /// Insert the log, moving to the next millisecond id while the id is taken.
    async fn create_log(&self, mut log: FetchLog) -> Result<FetchLog, SubmitError> {
        let base = log.created_at;
        for offset in 0..JOB_ID_ATTEMPTS {
            log.job_id = new_job_id(base + Duration::milliseconds(offset));
            if self.store.create_job(&log).await? {
                return Ok(log);
            }
        }
        Err(SubmitError::Other(anyhow::anyhow!(
            "no free job id near {}",
            new_job_id(base)
        )))
    }

    fn advance_last_record(&self, path: &Path) {
        let today = Utc::now().date_naive();
        match write_last_record(path, today) {
            Ok(()) => info!(path = %path.display(), %today, "last-record log advanced"),
            Err(err) => warn!(path = %path.display(), error = %format!("{err:#}"), "could not write last-record log"),
        }
    }
}

fn file_name_of(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

fn parse_manifest_date(value: &str) -> Option<NaiveDate> {
    MANIFEST_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
}

/// Turn a manifest entry into an ingest target, filling gaps from the export name.
pub fn manifest_target(
    entry: &FileManifestEntry,
    listing: &ListingConfig,
) -> Result<FileTarget, String> {
    let url = resolve_file_url(&entry.url, listing)
        .ok_or_else(|| format!("{}: cannot resolve file url", entry.url))?;
    let export = ExportName::parse(file_name_of(&url));

    let branch = entry
        .branch
        .clone()
        .or_else(|| export.as_ref().map(|e| e.branch.clone()))
        .filter(|b| !b.is_empty())
        .ok_or_else(|| format!("{url}: no branch given or in file name"))?;
    let pos = match entry.pos {
        Some(pos) => pos,
        None => export
            .as_ref()
            .and_then(|e| e.pos.parse().ok())
            .ok_or_else(|| format!("{url}: no pos given or in file name"))?,
    };
    let work_date = match entry.work_date {
        Some(date) => date,
        None => export
            .as_ref()
            .and_then(|e| parse_manifest_date(&e.date))
            .ok_or_else(|| format!("{url}: no work date given or in file name"))?,
    };
    let source_file = entry.source_file.clone().unwrap_or_else(|| url.clone());

    Ok(FileTarget {
        identity: FileIdentity::new(branch, pos, work_date, source_file),
        url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{JobLogOutage, MemorySource};
    use async_trait::async_trait;
    use posfeed_core::DedupePolicy;
    use posfeed_storage::{BackoffPolicy, FetchError, JobRepo, MemoryStore};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    const BODY: &str = "OR,ITEM_CODE,AMOUNT\n1,X1,5\n2,X2,7\n";

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[derive(Default)]
    struct FixedLister {
        files: HashMap<(String, u32), Vec<String>>,
        broken: Vec<(String, u32)>,
    }

    #[async_trait]
    impl FileLister for FixedLister {
        async fn list(
            &self,
            branch: &str,
            pos: u32,
            _date: NaiveDate,
        ) -> Result<Vec<String>, FetchError> {
            let key = (branch.to_string(), pos);
            if self.broken.contains(&key) {
                return Err(FetchError::HttpStatus {
                    status: 500,
                    url: "list".into(),
                });
            }
            Ok(self.files.get(&key).cloned().unwrap_or_default())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        runner: JobRunner,
        events: EventBus,
    }

    fn harness(
        root: &Path,
        source: Arc<MemorySource>,
        lister: Option<Arc<dyn FileLister>>,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_with_job_store(root, source, lister, store.clone(), store)
    }

    /// Like `harness`, but the runner records job logs in `job_store`.
    fn harness_with_job_store(
        root: &Path,
        source: Arc<MemorySource>,
        lister: Option<Arc<dyn FileLister>>,
        store: Arc<MemoryStore>,
        job_store: Arc<dyn Store>,
    ) -> Harness {
        let events = EventBus::default();
        let ingestor = StreamIngestor::new(
            store.clone(),
            source,
            ArtifactStore::new(root.join("latest")),
            events.clone(),
            IngestOptions {
                batch_size: 10,
                dedupe: DedupePolicy::Skip,
                backoff: BackoffPolicy {
                    max_attempts: 2,
                    base_delay: std::time::Duration::from_millis(1),
                    max_delay: std::time::Duration::from_millis(2),
                },
            },
        );
        let settings = RunnerSettings {
            branches: vec!["A".into()],
            positions: vec![1, 2],
            last_record_log: root.join("last_record.log"),
            combine: CombineOptions::new(root.join("latest"), root.join("record.csv")),
            listing: ListingConfig {
                file_base_url: Some("https://h/".into()),
                ..Default::default()
            },
        };
        Harness {
            runner: JobRunner::new(job_store, ingestor, lister, events.clone(), settings),
            store,
            events,
        }
    }

    #[tokio::test]
    async fn range_job_ingests_listed_files_and_keeps_listing_errors() {
        let dir = tempdir().unwrap();
        let source = Arc::new(
            MemorySource::new().with_file("https://h/a_A_1_rd5000_2025-07-01_.csv", BODY),
        );
        let mut lister = FixedLister::default();
        lister.files.insert(
            ("A".into(), 1),
            vec!["a_A_1_rd5000_2025-07-01_.csv".into()],
        );
        lister.broken.push(("A".into(), 2));
        let h = harness(dir.path(), source, Some(Arc::new(lister)));

        let job = h
            .runner
            .submit(JobSubmission::Range {
                start: date("2025-07-01"),
                end: date("2025-07-01"),
                branches: Vec::new(),
                positions: Vec::new(),
            })
            .await
            .unwrap();
        let mut sub = h.events.subscribe_job(job.job_id.clone());
        let summary = h.runner.run(job).await.unwrap();

        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.files_total, 1);
        assert_eq!(summary.files_completed, 1);
        assert_eq!(summary.rows_inserted, 2);

        let kinds: Vec<&str> = sub.drain().iter().map(JobEvent::kind).collect();
        assert_eq!(
            kinds,
            vec!["started", "file-start", "progress", "file-complete", "complete"]
        );

        let log = h.store.get_job(&summary.job_id).await.unwrap().unwrap();
        assert_eq!(log.status, JobStatus::Completed);
        assert_eq!(log.rows_inserted, 2);
        assert_eq!(log.positions, vec![1, 2]);
        assert_eq!(log.errors.len(), 1);
        assert!(log.errors[0].contains("A/2/2025-07-01"));
    }

    #[tokio::test]
    async fn job_log_outage_surfaces_the_original_error() {
        let dir = tempdir().unwrap();
        let url = "https://h/a_B_1_rd5000_20250702_.csv";
        let source = Arc::new(MemorySource::new().with_file(url, BODY));
        let store = Arc::new(MemoryStore::new());
        let job_store = Arc::new(JobLogOutage::new(store.clone()));
        let h = harness_with_job_store(dir.path(), source, None, store, job_store.clone());

        let job = h
            .runner
            .submit(JobSubmission::Files {
                files: vec![FileManifestEntry {
                    url: url.into(),
                    ..Default::default()
                }],
            })
            .await
            .unwrap();
        let job_id = job.job_id.clone();
        let mut sub = h.events.subscribe_job(job_id.clone());

        let err = h.runner.run(job).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        // The progress write, then both attempts to mark the job failed.
        assert_eq!(job_store.failed_writes.load(Ordering::SeqCst), 3);

        let events = sub.drain();
        assert!(matches!(
            events.last(),
            Some(JobEvent::Error { file: None, message, .. }) if message.contains("job table unavailable")
        ));
        let log = h.store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(log.status, JobStatus::Running);
        assert_eq!(h.store.reports().await.len(), 2);
    }

    #[tokio::test]
    async fn nothing_resolved_fails_at_submission() {
        let dir = tempdir().unwrap();
        let h = harness(
            dir.path(),
            Arc::new(MemorySource::new()),
            Some(Arc::new(FixedLister::default())),
        );
        let err = h
            .runner
            .submit(JobSubmission::Range {
                start: date("2025-07-01"),
                end: date("2025-07-02"),
                branches: Vec::new(),
                positions: Vec::new(),
            })
            .await
            .unwrap_err();
        let job_id = match err {
            SubmitError::NoFiles { job_id } => job_id,
            other => panic!("expected NoFiles, got {other}"),
        };
        let log = h.store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(log.status, JobStatus::Failed);
        assert_eq!(log.errors, vec!["no files resolved".to_string()]);
    }

    #[tokio::test]
    async fn submission_validation() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), Arc::new(MemorySource::new()), None);
        let range = JobSubmission::Range {
            start: date("2025-07-01"),
            end: date("2025-07-01"),
            branches: Vec::new(),
            positions: Vec::new(),
        };
        assert!(matches!(
            h.runner.submit(range).await,
            Err(SubmitError::ListingNotConfigured)
        ));
        assert!(matches!(
            h.runner
                .submit(JobSubmission::Range {
                    start: date("2025-07-02"),
                    end: date("2025-07-01"),
                    branches: Vec::new(),
                    positions: Vec::new(),
                })
                .await,
            Err(SubmitError::InvalidRange { .. })
        ));
        assert!(matches!(
            h.runner
                .submit(JobSubmission::FromLog {
                    end: None,
                    branches: Vec::new(),
                    positions: Vec::new(),
                })
                .await,
            Err(SubmitError::NoLastRecord(_))
        ));
    }

    #[tokio::test]
    async fn manifest_jobs_skip_completed_files_and_record_failures() {
        let dir = tempdir().unwrap();
        let good = "https://h/a_B_2_rd5000_20250702_.csv";
        let source = Arc::new(MemorySource::new().with_file(good, BODY));
        let h = harness(dir.path(), source, None);
        let manifest = vec![
            FileManifestEntry {
                url: good.into(),
                ..Default::default()
            },
            FileManifestEntry {
                url: "gone.csv".into(),
                branch: Some("B".into()),
                pos: Some(1),
                work_date: Some(date("2025-07-02")),
                source_file: None,
            },
            FileManifestEntry {
                url: "https://h/unnamed.csv".into(),
                ..Default::default()
            },
        ];

        let job = h
            .runner
            .submit(JobSubmission::Files {
                files: manifest.clone(),
            })
            .await
            .unwrap();
        let JobWork::Files(targets) = &job.work else {
            panic!("expected file work");
        };
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].identity.branch, "B");
        assert_eq!(targets[0].identity.pos, 2);
        assert_eq!(targets[0].identity.work_date, date("2025-07-02"));
        assert_eq!(targets[1].url, "https://h/gone.csv");

        let first = h.runner.run(job).await.unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!(first.files_completed, 1);
        assert_eq!(first.rows_inserted, 2);
        assert_eq!(first.errors.len(), 1);
        let log = h.store.get_job(&first.job_id).await.unwrap().unwrap();
        // The unresolvable manifest entry plus the missing download.
        assert_eq!(log.errors.len(), 2);

        let again = h
            .runner
            .submit(JobSubmission::Files { files: manifest })
            .await
            .unwrap();
        assert_ne!(again.job_id, first.job_id);
        let second = h.runner.run(again).await.unwrap();
        assert_eq!(second.files_skipped, 1);
        assert_eq!(second.rows_inserted, 0);
        assert_eq!(h.store.reports().await.len(), 2);
    }

    #[tokio::test]
    async fn from_log_job_advances_the_log() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("last_record.log");
        write_last_record(&log_path, date("2025-07-01")).unwrap();
        let source = Arc::new(
            MemorySource::new().with_file("https://h/a_A_1_rd5000_2025-07-01_.csv", BODY),
        );
        let mut lister = FixedLister::default();
        lister.files.insert(
            ("A".into(), 1),
            vec!["a_A_1_rd5000_2025-07-01_.csv".into()],
        );
        let h = harness(dir.path(), source, Some(Arc::new(lister)));

        let job = h
            .runner
            .submit(JobSubmission::FromLog {
                end: Some(date("2025-07-01")),
                branches: Vec::new(),
                positions: vec![1],
            })
            .await
            .unwrap();
        assert_eq!(job.log_update.as_deref(), Some(log_path.as_path()));
        let summary = h.runner.run(job).await.unwrap();
        assert_eq!(summary.rows_inserted, 2);
        assert_eq!(
            read_last_record(&log_path).unwrap(),
            Some(Utc::now().date_naive())
        );
    }

    #[tokio::test]
    async fn combine_without_workdir_fails_the_job() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), Arc::new(MemorySource::new()), None);
        let job = h
            .runner
            .submit(JobSubmission::Combine {
                workdir: Some(dir.path().join("nowhere")),
            })
            .await
            .unwrap();
        let summary = h.runner.run(job).await.unwrap();
        assert_eq!(summary.status, JobStatus::Failed);
        let log = h.store.get_job(&summary.job_id).await.unwrap().unwrap();
        assert_eq!(log.status, JobStatus::Failed);
        assert!(log.errors[0].contains("workdir not found"));
    }

    #[test]
    fn manifest_entries_deserialize_with_date_alias() {
        let entries: Vec<FileManifestEntry> = serde_json::from_str(
            r#"[{"url": "x.csv", "branch": "B", "pos": 3, "date": "2025-07-01"}, {"url": "y.csv"}]"#,
        )
        .unwrap();
        assert_eq!(entries[0].work_date, Some(date("2025-07-01")));
        assert_eq!(entries[1].branch, None);
    }
}
