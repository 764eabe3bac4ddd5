use std::sync::Arc;

use posfeed_core::IngestedRow;

use crate::repo::{InsertOutcome, Store, StoreResult};

/// Result of flushing one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub batch_rows: u64,
    pub rejected: u64,
    pub total_rows: u64,
}

/// Accumulates rows and bulk-inserts them every `batch_size` rows.
pub struct BatchWriter {
    store: Arc<dyn Store>,
    batch_size: usize,
    pending: Vec<IngestedRow>,
    totals: InsertOutcome,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn Store>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            totals: InsertOutcome::default(),
        }
    }

    pub async fn push(&mut self, row: IngestedRow) -> StoreResult<Option<FlushReport>> {
        self.pending.push(row);
        if self.pending.len() >= self.batch_size {
            return self.flush().await.map(Some);
        }
        Ok(None)
    }

    pub async fn flush(&mut self) -> StoreResult<FlushReport> {
        if self.pending.is_empty() {
            return Ok(FlushReport {
                batch_rows: 0,
                rejected: 0,
                total_rows: self.totals.inserted,
            });
        }
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        let outcome = self.store.insert_reports(&batch).await?;
        self.totals.absorb(outcome);
        if outcome.rejected > 0 {
            tracing::debug!(rejected = outcome.rejected, "duplicate rows skipped");
        }
        Ok(FlushReport {
            batch_rows: outcome.inserted,
            rejected: outcome.rejected,
            total_rows: self.totals.inserted,
        })
    }

    /// Flush the remainder. `None` when nothing was pending.
    pub async fn finish(&mut self) -> StoreResult<Option<FlushReport>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        self.flush().await.map(Some)
    }

    pub fn totals(&self) -> InsertOutcome {
        self.totals
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
