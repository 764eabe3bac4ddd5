//! In-process store used by tests and `--dry-run` runs.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use posfeed_core::{
    ClaimOutcome, CompletedFile, DedupePolicy, FetchLog, FileIdentity, FileRecord, FileStatus,
    IngestedRow, JobMode, JobStatus, ReportBackup,
};
use tokio::sync::Mutex;

use crate::repo::{
    page_window, ClaimRepo, InsertOutcome, JobRepo, ReportFilter, ReportPage, ReportRepo,
    StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<FileIdentity, FileRecord>,
    reports: Vec<IngestedRow>,
    unique_keys: HashSet<String>,
    backups: Vec<ReportBackup>,
    jobs: HashMap<String, FetchLog>,
}

/// Every operation holds one lock, which makes the claim check-and-set atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<IngestedRow> {
        self.state.lock().await.reports.clone()
    }

    pub async fn backups(&self) -> Vec<ReportBackup> {
        self.state.lock().await.backups.clone()
    }

    pub async fn files(&self) -> Vec<FileRecord> {
        let mut files: Vec<_> = self.state.lock().await.files.values().cloned().collect();
        files.sort_by(|a, b| a.identity.cmp(&b.identity));
        files
    }

    /// Seed a claim record directly, e.g. to simulate a crashed worker.
    pub async fn put_file(&self, record: FileRecord) {
        self.state
            .lock()
            .await
            .files
            .insert(record.identity.clone(), record);
    }

    /// Seed a backup directly with a chosen `created_at`.
    pub async fn put_backup(&self, backup: ReportBackup) {
        self.state.lock().await.backups.push(backup);
    }
}

fn reclaim(record: &mut FileRecord, now: DateTime<Utc>) {
    record.status = FileStatus::Processing;
    record.error = None;
    record.fetched_at = Some(now);
    record.updated_at = now;
}

fn held_claim<'a>(
    files: &'a mut HashMap<FileIdentity, FileRecord>,
    identity: &FileIdentity,
) -> StoreResult<&'a mut FileRecord> {
    files
        .get_mut(identity)
        .filter(|record| record.status == FileStatus::Processing)
        .ok_or_else(|| StoreError::ClaimNotHeld(identity.to_string()))
}

#[async_trait]
impl ClaimRepo for MemoryStore {
    async fn claim_file(
        &self,
        identity: &FileIdentity,
        policy: DedupePolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        let mut state = self.state.lock().await;
        let Some(record) = state.files.get_mut(identity) else {
            state.files.insert(
                identity.clone(),
                FileRecord::processing(identity.clone(), now),
            );
            return Ok(ClaimOutcome::Claimed { reclaimed: false });
        };

        let outcome = match (record.status, policy) {
            (FileStatus::Processing, _) => ClaimOutcome::InProgress,
            (FileStatus::Completed, DedupePolicy::Skip) => ClaimOutcome::AlreadyCompleted,
            (FileStatus::Completed, DedupePolicy::Replace)
            | (FileStatus::Error, _)
            | (FileStatus::Raw, _) => {
                reclaim(record, now);
                ClaimOutcome::Claimed { reclaimed: true }
            }
        };
        Ok(outcome)
    }

    async fn complete_file(
        &self,
        identity: &FileIdentity,
        file: &CompletedFile,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = held_claim(&mut state.files, identity)?;
        record.status = FileStatus::Completed;
        record.storage_path = Some(file.storage_path.clone());
        record.size = Some(file.size);
        record.checksum = Some(file.checksum.clone());
        record.error = None;
        record.completed_at = Some(now);
        record.updated_at = now;
        Ok(())
    }

    async fn fail_file(
        &self,
        identity: &FileIdentity,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = held_claim(&mut state.files, identity)?;
        record.status = FileStatus::Error;
        record.error = Some(error.to_string());
        record.updated_at = now;
        Ok(())
    }

    async fn reset_file(&self, identity: &FileIdentity, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.files.get_mut(identity) {
            Some(record)
                if matches!(record.status, FileStatus::Processing | FileStatus::Error) =>
            {
                record.status = FileStatus::Raw;
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_file(&self, identity: &FileIdentity) -> StoreResult<Option<FileRecord>> {
        Ok(self.state.lock().await.files.get(identity).cloned())
    }

    async fn distinct_branches(&self) -> StoreResult<Vec<String>> {
        let state = self.state.lock().await;
        let branches: BTreeSet<String> = state
            .files
            .keys()
            .map(|id| id.branch.clone())
            .chain(state.reports.iter().map(|r| r.branch.clone()))
            .collect();
        Ok(branches.into_iter().collect())
    }
}

#[async_trait]
impl ReportRepo for MemoryStore {
    async fn insert_reports(&self, rows: &[IngestedRow]) -> StoreResult<InsertOutcome> {
        let mut state = self.state.lock().await;
        let mut outcome = InsertOutcome::default();
        for row in rows {
            if let Some(key) = &row.unique_key {
                if !state.unique_keys.insert(key.clone()) {
                    outcome.rejected += 1;
                    continue;
                }
            }
            state.reports.push(row.clone());
            outcome.inserted += 1;
        }
        Ok(outcome)
    }

    async fn count_reports(&self, filter: &ReportFilter) -> StoreResult<u64> {
        let state = self.state.lock().await;
        Ok(state.reports.iter().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn find_reports(
        &self,
        filter: &ReportFilter,
        page: u64,
        limit: u64,
    ) -> StoreResult<ReportPage> {
        let (page, limit) = page_window(page, limit);
        let state = self.state.lock().await;
        let mut matching: Vec<&IngestedRow> =
            state.reports.iter().filter(|r| filter.matches(r)).collect();
        matching.sort_by(|a, b| {
            b.work_date
                .cmp(&a.work_date)
                .then_with(|| (&a.branch, a.pos, a.ingested_at).cmp(&(&b.branch, b.pos, b.ingested_at)))
        });
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(((page - 1) * limit) as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(ReportPage {
            items,
            total,
            page,
            page_size: limit,
        })
    }

    async fn backup_and_delete(
        &self,
        identity: &FileIdentity,
        replaced_by_job: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let filter = ReportFilter::for_identity(identity);
        let (doomed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.reports)
            .into_iter()
            .partition(|r| filter.matches(r));
        state.reports = kept;

        let removed = doomed.len() as u64;
        for row in doomed {
            if let Some(key) = &row.unique_key {
                state.unique_keys.remove(key);
            }
            state
                .backups
                .push(ReportBackup::of(row, replaced_by_job, now));
        }
        Ok(removed)
    }

    async fn count_backups(&self, created_before: Option<DateTime<Utc>>) -> StoreResult<u64> {
        let state = self.state.lock().await;
        Ok(state
            .backups
            .iter()
            .filter(|b| created_before.map_or(true, |cutoff| b.created_at < cutoff))
            .count() as u64)
    }

    async fn delete_backups_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.backups.len();
        state.backups.retain(|b| b.created_at >= cutoff);
        Ok((before - state.backups.len()) as u64)
    }
}

#[async_trait]
impl JobRepo for MemoryStore {
    async fn create_job(&self, log: &FetchLog) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&log.job_id) {
            return Ok(false);
        }
        state.jobs.insert(log.job_id.clone(), log.clone());
        Ok(true)
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<FetchLog>> {
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }

    async fn mark_job_running(
        &self,
        job_id: &str,
        files_total: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .entry(job_id.to_string())
            .or_insert_with(|| FetchLog::queued(job_id, JobMode::Files, now));
        job.status = JobStatus::Running;
        job.files_total = files_total;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn update_job_progress(
        &self,
        job_id: &str,
        rows_inserted: u64,
        files_completed: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        job.rows_inserted = rows_inserted;
        job.files_completed = files_completed;
        job.updated_at = now;
        Ok(())
    }

    async fn append_job_error(
        &self,
        job_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        job.errors.push(message.to_string());
        job.updated_at = now;
        Ok(())
    }

    async fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        job.status = status;
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, NaiveDate};
    use posfeed_core::FieldMap;

    use super::*;

    fn identity(file: &str) -> FileIdentity {
        FileIdentity::new(
            "AYALA-FRN",
            1,
            NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            file,
        )
    }

    fn row(id: &FileIdentity, receipt: &str) -> IngestedRow {
        let mut data = FieldMap::new();
        data.insert("OR".into(), receipt.into());
        data.insert("TIME".into(), "10:00".into());
        data.insert("ITEM_CODE".into(), "X1".into());
        IngestedRow::from_fields("job", id, data, Utc::now())
    }

    #[tokio::test]
    async fn concurrent_claims_have_a_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let id = identity("f.csv");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim_file(&id, DedupePolicy::Skip, Utc::now())
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ClaimOutcome::Claimed { .. } => winners += 1,
                other => assert_eq!(other, ClaimOutcome::InProgress),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn claim_state_machine_follows_policy() {
        let store = MemoryStore::new();
        let id = identity("f.csv");
        let now = Utc::now();

        assert_eq!(
            store.claim_file(&id, DedupePolicy::Skip, now).await.unwrap(),
            ClaimOutcome::Claimed { reclaimed: false }
        );
        store
            .complete_file(
                &id,
                &CompletedFile {
                    storage_path: "p".into(),
                    size: 3,
                    checksum: "c".into(),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(
            store.claim_file(&id, DedupePolicy::Skip, now).await.unwrap(),
            ClaimOutcome::AlreadyCompleted
        );
        assert_eq!(
            store
                .claim_file(&id, DedupePolicy::Replace, now)
                .await
                .unwrap(),
            ClaimOutcome::Claimed { reclaimed: true }
        );
        store.fail_file(&id, "boom", now).await.unwrap();
        let record = store.find_file(&id).await.unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Error);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert_eq!(
            store.claim_file(&id, DedupePolicy::Skip, now).await.unwrap(),
            ClaimOutcome::Claimed { reclaimed: true }
        );
    }

    #[tokio::test]
    async fn completing_without_a_claim_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .fail_file(&identity("nope.csv"), "x", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ClaimNotHeld(_)));
    }

    #[tokio::test]
    async fn stuck_claims_can_be_reset() {
        let store = MemoryStore::new();
        let id = identity("f.csv");
        store.put_file(FileRecord::processing(id.clone(), Utc::now())).await;
        assert!(store.reset_file(&id, Utc::now()).await.unwrap());
        assert_eq!(
            store.find_file(&id).await.unwrap().unwrap().status,
            FileStatus::Raw
        );
        assert!(!store.reset_file(&id, Utc::now()).await.unwrap());
        assert!(store
            .claim_file(&id, DedupePolicy::Skip, Utc::now())
            .await
            .unwrap()
            .is_claimed());
    }

    #[tokio::test]
    async fn duplicate_fingerprints_are_counted_not_raised() {
        let store = MemoryStore::new();
        let a = identity("a.csv");
        let rows = vec![row(&a, "1"), row(&a, "2"), row(&a, "1")];
        let outcome = store.insert_reports(&rows).await.unwrap();
        assert_eq!(
            outcome,
            InsertOutcome {
                inserted: 2,
                rejected: 1
            }
        );

        let mut keyless = row(&a, "3");
        keyless.unique_key = None;
        let again = store
            .insert_reports(&[keyless.clone(), keyless])
            .await
            .unwrap();
        assert_eq!(again.inserted, 2);
    }

    #[tokio::test]
    async fn backup_and_delete_frees_fingerprints() {
        let store = MemoryStore::new();
        let a = identity("a.csv");
        let b = identity("b.csv");
        store
            .insert_reports(&[row(&a, "1"), row(&a, "2"), row(&b, "9")])
            .await
            .unwrap();

        let removed = store.backup_and_delete(&a, "job-2", Utc::now()).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count_reports(&ReportFilter::default()).await.unwrap(), 1);
        let backups = store.backups().await;
        assert_eq!(backups.len(), 2);
        assert!(backups.iter().all(|b| b.replaced_by_job == "job-2"));

        let outcome = store.insert_reports(&[row(&a, "1")]).await.unwrap();
        assert_eq!(outcome.inserted, 1);
    }

    #[tokio::test]
    async fn backups_older_than_cutoff_are_deleted() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = identity("a.csv");
        let mut old = ReportBackup::of(row(&id, "1"), "j", now);
        old.created_at = now - Duration::days(91);
        store.put_backup(old).await;
        store.put_backup(ReportBackup::of(row(&id, "2"), "j", now)).await;

        let cutoff = now - Duration::days(90);
        assert_eq!(store.count_backups(Some(cutoff)).await.unwrap(), 1);
        assert_eq!(store.delete_backups_before(cutoff).await.unwrap(), 1);
        assert_eq!(store.count_backups(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn report_pages_are_bounded() {
        let store = MemoryStore::new();
        let id = identity("a.csv");
        let rows: Vec<_> = (0..7).map(|n| row(&id, &n.to_string())).collect();
        store.insert_reports(&rows).await.unwrap();
        let page = store
            .find_reports(&ReportFilter::default(), 2, 3)
            .await
            .unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.items.len(), 3);
        let last = store
            .find_reports(&ReportFilter::default(), 3, 3)
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
    }

    #[tokio::test]
    async fn job_log_tracks_lifecycle() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let log = FetchLog::queued("42", JobMode::Range, now);
        assert!(store.create_job(&log).await.unwrap());
        assert!(!store.create_job(&log).await.unwrap());

        store.mark_job_running("42", 3, now).await.unwrap();
        store.update_job_progress("42", 10, 1, now).await.unwrap();
        store.append_job_error("42", "first", now).await.unwrap();
        store.append_job_error("42", "second", now).await.unwrap();
        store
            .finish_job("42", JobStatus::Completed, now)
            .await
            .unwrap();

        let job = store.get_job("42").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.files_total, 3);
        assert_eq!(job.rows_inserted, 10);
        assert_eq!(job.errors, vec!["first".to_string(), "second".to_string()]);
        assert!(matches!(
            store.update_job_progress("missing", 0, 0, now).await,
            Err(StoreError::JobNotFound(_))
        ));
    }
}
