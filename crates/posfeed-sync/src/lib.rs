//! Fetch orchestration: configuration, claims, streaming ingest, jobs, exports and housekeeping.

use anyhow::{Context, Result};
use posfeed_storage::PgStore;
use tracing::info;

pub mod claims;
pub mod config;
pub mod export;
pub mod ingest;
pub mod last_record;
pub mod listing;
pub mod missing;
pub mod registry;
pub mod retention;
pub mod runner;

#[cfg(test)]
mod testing;

pub use claims::ClaimTracker;
pub use config::{ConfigError, SyncConfig};
pub use export::{export_reports, ExportError, ExportOptions, ExportSummary};
pub use ingest::{IngestError, IngestOptions, IngestOutcome, StreamIngestor};
pub use last_record::{read_last_record, write_last_record};
pub use listing::{
    parse_listing, resolve_file_url, FileLister, HttpLister, ListMethod, ListingConfig,
    ListingRequest, ResolvedFiles,
};
pub use missing::{scan, MissingEntry, MissingReport, ScanOptions};
pub use registry::{BranchConfig, BranchRegistry};
pub use retention::{build_retention_scheduler, run_retention, RetentionReport};
pub use runner::{
    FileManifestEntry, JobRunner, JobSubmission, JobSummary, JobWork, QueuedJob, RunnerSettings,
    SubmitError,
};

pub const CRATE_NAME: &str = "posfeed-sync";

const PG_MAX_CONNECTIONS: u32 = 5;

/// Connect to Postgres and make sure the tables exist.
pub async fn connect_store(config: &SyncConfig) -> Result<PgStore> {
    let url = config.require_database_url()?;
    let store = PgStore::connect(url, PG_MAX_CONNECTIONS)
        .await
        .context("connecting to postgres")?;
    store.ensure_schema().await.context("ensuring schema")?;
    info!("postgres store ready");
    Ok(store)
}
