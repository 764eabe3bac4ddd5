//! ReportBackup retention, run once or on a cron schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use posfeed_storage::{Store, StoreResult};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub matched: u64,
    /// `None` on a dry run.
    pub deleted: Option<u64>,
    pub cutoff: DateTime<Utc>,
    pub dry_run: bool,
}

pub async fn run_retention(store: &dyn Store, days: i64, dry_run: bool) -> StoreResult<RetentionReport> {
    run_retention_at(store, days, dry_run, Utc::now()).await
}

/// Count, and unless `dry_run` delete, backups created before `now - days`.
pub async fn run_retention_at(
    store: &dyn Store,
    days: i64,
    dry_run: bool,
    now: DateTime<Utc>,
) -> StoreResult<RetentionReport> {
    let cutoff = now - Duration::days(days.max(0));
    let matched = store.count_backups(Some(cutoff)).await?;
    let deleted = if dry_run {
        None
    } else {
        Some(store.delete_backups_before(cutoff).await?)
    };
    info!(%cutoff, matched, ?deleted, dry_run, "backup retention");
    Ok(RetentionReport {
        matched,
        deleted,
        cutoff,
        dry_run,
    })
}

/// A scheduler that runs retention on `cron`. A tick that lands while the previous run
/// is still going is skipped. The caller starts it.
pub async fn build_retention_scheduler(
    store: Arc<dyn Store>,
    cron: &str,
    days: i64,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(AtomicBool::new(false));

    let job = Job::new_async(cron, move |_uuid, _l| {
        let store = store.clone();
        let running = running.clone();
        Box::pin(async move {
            if running.swap(true, Ordering::SeqCst) {
                warn!("previous retention run still active, skipping");
                return;
            }
            if let Err(err) = run_retention(store.as_ref(), days, false).await {
                error!(error = %err, "scheduled retention failed");
            }
            running.store(false, Ordering::SeqCst);
        })
    })
    .with_context(|| format!("creating retention job for cron {cron}"))?;
    sched.add(job).await.context("adding retention job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use posfeed_core::{FileIdentity, IngestedRow, ReportBackup};
    use posfeed_storage::MemoryStore;

    fn backup_at(source: &str, at: DateTime<Utc>) -> ReportBackup {
        let identity = FileIdentity::new(
            "B",
            1,
            NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            source,
        );
        let row = IngestedRow::from_fields("j0", &identity, Default::default(), at);
        ReportBackup::of(row, "j1", at)
    }

    #[tokio::test]
    async fn dry_run_counts_and_real_run_deletes() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.put_backup(backup_at("old-a.csv", now - Duration::days(120))).await;
        store.put_backup(backup_at("old-b.csv", now - Duration::days(91))).await;
        store.put_backup(backup_at("fresh.csv", now - Duration::days(10))).await;

        let dry = run_retention_at(&store, 90, true, now).await.unwrap();
        assert_eq!(dry.matched, 2);
        assert_eq!(dry.deleted, None);
        assert_eq!(store.backups().await.len(), 3);

        let real = run_retention_at(&store, 90, false, now).await.unwrap();
        assert_eq!(real.deleted, Some(2));
        assert_eq!(real.cutoff, now - Duration::days(90));
        let left = store.backups().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].row.source_file, "fresh.csv");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_cron_is_an_error() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        assert!(build_retention_scheduler(store.clone(), "not a cron", 90)
            .await
            .is_err());
        assert!(build_retention_scheduler(store, "0 0 3 * * *", 90)
            .await
            .is_ok());
    }
}
