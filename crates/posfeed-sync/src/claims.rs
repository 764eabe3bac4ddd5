//! File claim tracker: the single point of mutual exclusion between workers.

use std::sync::Arc;

use chrono::Utc;
use posfeed_core::{ClaimOutcome, CompletedFile, DedupePolicy, FileIdentity, FileRecord};
use posfeed_storage::{Store, StoreResult};
use tracing::{debug, info};

#[derive(Clone)]
pub struct ClaimTracker {
    store: Arc<dyn Store>,
    policy: DedupePolicy,
}

impl ClaimTracker {
    pub fn new(store: Arc<dyn Store>, policy: DedupePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> DedupePolicy {
        self.policy
    }

    /// One atomic conditional write. A refused claim is a normal skip, not an error.
    pub async fn claim(&self, identity: &FileIdentity) -> StoreResult<ClaimOutcome> {
        let outcome = self
            .store
            .claim_file(identity, self.policy, Utc::now())
            .await?;
        debug!(%identity, policy = self.policy.as_str(), ?outcome, "claim attempt");
        Ok(outcome)
    }

    pub async fn complete(&self, identity: &FileIdentity, file: &CompletedFile) -> StoreResult<()> {
        self.store.complete_file(identity, file, Utc::now()).await
    }

    pub async fn fail(&self, identity: &FileIdentity, error: &str) -> StoreResult<()> {
        self.store.fail_file(identity, error, Utc::now()).await
    }

    /// Release a stuck claim so the next run can pick the file up again.
    pub async fn reset(&self, identity: &FileIdentity) -> StoreResult<bool> {
        let changed = self.store.reset_file(identity, Utc::now()).await?;
        info!(%identity, changed, "claim reset");
        Ok(changed)
    }

    pub async fn status(&self, identity: &FileIdentity) -> StoreResult<Option<FileRecord>> {
        self.store.find_file(identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use posfeed_core::FileStatus;
    use posfeed_storage::{MemoryStore, StoreError};

    fn identity() -> FileIdentity {
        FileIdentity::new(
            "AYALA",
            1,
            NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            "a_AYALA_1_rd5000_2025-07-01_.csv",
        )
    }

    fn artifact() -> CompletedFile {
        CompletedFile {
            storage_path: "AYALA/2025-07-01/1/f.csv".into(),
            size: 10,
            checksum: "abc".into(),
        }
    }

    #[tokio::test]
    async fn concurrent_claims_admit_exactly_one_worker() {
        let store = Arc::new(MemoryStore::new());
        let first = ClaimTracker::new(store.clone(), DedupePolicy::Skip);
        let second = ClaimTracker::new(store.clone(), DedupePolicy::Skip);
        let id = identity();

        let (a, b) = tokio::join!(first.claim(&id), second.claim(&id));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| o.is_claimed()).count(), 1);
        assert!(outcomes.contains(&ClaimOutcome::InProgress));
    }

    #[tokio::test]
    async fn completed_files_are_skipped_unless_replacing() {
        let store = Arc::new(MemoryStore::new());
        let skip = ClaimTracker::new(store.clone(), DedupePolicy::Skip);
        let id = identity();
        assert!(skip.claim(&id).await.unwrap().is_claimed());
        skip.complete(&id, &artifact()).await.unwrap();

        assert_eq!(skip.claim(&id).await.unwrap(), ClaimOutcome::AlreadyCompleted);

        let replace = ClaimTracker::new(store.clone(), DedupePolicy::Replace);
        assert_eq!(
            replace.claim(&id).await.unwrap(),
            ClaimOutcome::Claimed { reclaimed: true }
        );
        assert_eq!(replace.claim(&id).await.unwrap(), ClaimOutcome::InProgress);
    }

    #[tokio::test]
    async fn failed_claims_can_be_retried_later() {
        let store = Arc::new(MemoryStore::new());
        let tracker = ClaimTracker::new(store, DedupePolicy::Skip);
        let id = identity();
        tracker.claim(&id).await.unwrap();
        tracker.fail(&id, "timeout").await.unwrap();

        let record = tracker.status(&id).await.unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Error);
        assert_eq!(record.error.as_deref(), Some("timeout"));
        assert!(tracker.claim(&id).await.unwrap().is_claimed());
    }

    #[tokio::test]
    async fn reset_frees_a_stuck_claim() {
        let store = Arc::new(MemoryStore::new());
        let tracker = ClaimTracker::new(store, DedupePolicy::Skip);
        let id = identity();
        tracker.claim(&id).await.unwrap();
        assert_eq!(tracker.claim(&id).await.unwrap(), ClaimOutcome::InProgress);

        assert!(tracker.reset(&id).await.unwrap());
        assert!(tracker.claim(&id).await.unwrap().is_claimed());
    }

    #[tokio::test]
    async fn completing_without_a_claim_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let tracker = ClaimTracker::new(store, DedupePolicy::Skip);
        let err = tracker.complete(&identity(), &artifact()).await.unwrap_err();
        assert!(matches!(err, StoreError::ClaimNotHeld(_)));
    }
}
