use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use posfeed_core::{FileIdentity, JobEvent};
use posfeed_storage::{JobRepo, MemoryStore, ReportFilter, ReportRepo, Store};
use posfeed_sync::{
    build_retention_scheduler, connect_store, export_reports, run_retention, scan, ClaimTracker,
    ExportOptions, FileManifestEntry, JobRunner, JobSubmission, ScanOptions, SubmitError,
    SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_DIRECTIVES: &str =
    "posfeed=info,posfeed_core=info,posfeed_storage=info,posfeed_combine=info,posfeed_sync=info";

#[derive(Debug, Parser)]
#[command(name = "posfeed")]
#[command(about = "POS export ingest and enrichment")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Targets {
    /// Branch ids; defaults to POSFEED_BRANCHES or the enabled registry entries.
    #[arg(long = "branch", value_delimiter = ',')]
    branches: Vec<String>,
    /// Terminal numbers; defaults to POSFEED_POSITIONS.
    #[arg(long = "pos", value_delimiter = ',')]
    positions: Vec<u32>,
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Artifacts root; defaults to POSFEED_ARTIFACTS_DIR.
    #[arg(long)]
    workdir: Option<PathBuf>,
    #[arg(long)]
    start: Option<NaiveDate>,
    #[arg(long)]
    end: Option<NaiveDate>,
    /// A transaction export whose dates show the usual operating weekdays.
    #[arg(long)]
    sample: Option<PathBuf>,
    #[command(flatten)]
    targets: Targets,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch a date range through the listing endpoint.
    Fetch {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[command(flatten)]
        targets: Targets,
    },
    /// Fetch the files named in a JSON manifest.
    FetchFiles { manifest: PathBuf },
    /// Scan for missing dates, then fetch them.
    FetchMissing(ScanArgs),
    /// Fetch from the last-record date up to yesterday (or --end).
    FetchFromLog {
        #[arg(long)]
        end: Option<NaiveDate>,
        #[command(flatten)]
        targets: Targets,
    },
    /// Enrich downloaded export groups into the flat output and the report store.
    Combine {
        #[arg(long)]
        workdir: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Keep documents in memory instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the missing-date report as JSON.
    Missing(ScanArgs),
    /// Prune report backups older than the retention window.
    Retention {
        #[arg(long)]
        days: Option<i64>,
        #[arg(long)]
        dry_run: bool,
        /// Keep running and prune on POSFEED_RETENTION_CRON until interrupted.
        #[arg(long)]
        schedule: bool,
    },
    /// Show a job log.
    Status { job_id: String },
    /// Query stored report rows, newest work date first.
    Reports {
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        pos: Option<u32>,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
    /// Write every matching report row to a CSV file, gzip-compressed for `.gz` paths.
    Export {
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        pos: Option<u32>,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        job: Option<String>,
        /// Field columns after the row metadata; defaults to the first row's fields.
        #[arg(long = "column", value_delimiter = ',')]
        columns: Vec<String>,
        #[arg(long)]
        gzip: bool,
    },
    /// Move a stuck claim back to raw.
    ResetClaim {
        branch: String,
        pos: u32,
        date: NaiveDate,
        source_file: String,
    },
    /// Create the Postgres tables if absent.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn persistent_store(config: &SyncConfig) -> Result<Arc<dyn Store>> {
    Ok(Arc::new(connect_store(config).await?))
}

fn scan_options(config: &SyncConfig, args: ScanArgs) -> ScanOptions {
    ScanOptions {
        workdir: args.workdir.unwrap_or_else(|| config.artifacts_dir.clone()),
        start: args.start,
        end: args.end,
        branches: if args.targets.branches.is_empty() {
            config.branches.clone()
        } else {
            args.targets.branches
        },
        positions: args.targets.positions,
        sample_file: args.sample,
    }
}

fn log_event(event: &JobEvent) {
    match event {
        JobEvent::Error {
            job_id,
            file,
            message,
        } => warn!(
            job_id = %job_id,
            file = file.as_deref().unwrap_or("-"),
            message = %message,
            "job error"
        ),
        JobEvent::Skipped {
            job_id,
            file,
            reason,
        } => info!(job_id = %job_id, file = %file, reason = %reason, "file skipped"),
        JobEvent::Progress {
            job_id,
            file,
            batch_rows,
            total_rows,
        } => info!(job_id = %job_id, file = %file, batch_rows, total_rows, "progress"),
        JobEvent::FileComplete {
            job_id,
            file,
            rows,
            files_completed,
            files_total,
        } => info!(
            job_id = %job_id,
            file = %file,
            rows,
            files_completed,
            files_total,
            "file complete"
        ),
        other => info!(job_id = other.job_id(), kind = other.kind(), "job event"),
    }
}

/// Submit, run and report one job, streaming its events to the log.
async fn submit_and_run(runner: JobRunner, submission: JobSubmission) -> Result<()> {
    let job = match runner.submit(submission).await {
        Ok(job) => job,
        Err(SubmitError::NoFiles { job_id }) => {
            anyhow::bail!("job {job_id} failed: no files resolved")
        }
        Err(err) => return Err(err.into()),
    };

    let mut events = runner.events().subscribe_job(job.job_id.clone());
    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let summary = runner.run(job).await;
    // Dropping the runner closes the bus so the logger drains and stops.
    drop(runner);
    let _ = logger.await;

    let summary = summary.context("running job")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn build_runner(config: &SyncConfig, store: Arc<dyn Store>) -> Result<JobRunner> {
    JobRunner::from_config(config, store, Default::default()).context("building job runner")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command {
        Commands::Fetch {
            start,
            end,
            targets,
        } => {
            let runner = build_runner(&config, persistent_store(&config).await?)?;
            submit_and_run(
                runner,
                JobSubmission::Range {
                    start,
                    end,
                    branches: targets.branches,
                    positions: targets.positions,
                },
            )
            .await?;
        }
        Commands::FetchFiles { manifest } => {
            let text = std::fs::read_to_string(&manifest)
                .with_context(|| format!("reading {}", manifest.display()))?;
            let files: Vec<FileManifestEntry> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", manifest.display()))?;
            let runner = build_runner(&config, persistent_store(&config).await?)?;
            submit_and_run(runner, JobSubmission::Files { files }).await?;
        }
        Commands::FetchMissing(args) => {
            let options = scan_options(&config, args);
            let report = scan(&options, Utc::now().date_naive())?;
            let branches_missing = report.branches_missing();
            if branches_missing.is_empty() {
                info!(start = %report.start, end = %report.end, "no missing dates");
                return Ok(());
            }
            let runner = build_runner(&config, persistent_store(&config).await?)?;
            submit_and_run(runner, JobSubmission::Missing { branches_missing }).await?;
        }
        Commands::FetchFromLog { end, targets } => {
            let runner = build_runner(&config, persistent_store(&config).await?)?;
            submit_and_run(
                runner,
                JobSubmission::FromLog {
                    end,
                    branches: targets.branches,
                    positions: targets.positions,
                },
            )
            .await?;
        }
        Commands::Combine {
            workdir,
            out,
            dry_run,
        } => {
            let mut config = config;
            if let Some(out) = out {
                config.combine_out = out;
            }
            let store: Arc<dyn Store> = if dry_run {
                Arc::new(MemoryStore::new())
            } else {
                persistent_store(&config).await?
            };
            let runner = build_runner(&config, store)?;
            submit_and_run(runner, JobSubmission::Combine { workdir }).await?;
        }
        Commands::Missing(args) => {
            let options = scan_options(&config, args);
            let report = scan(&options, Utc::now().date_naive())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Retention {
            days,
            dry_run,
            schedule,
        } => {
            let days = days.unwrap_or(config.backup_retention_days);
            let store = persistent_store(&config).await?;
            if schedule {
                let mut sched =
                    build_retention_scheduler(store, &config.retention_cron, days).await?;
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.retention_cron, days, "retention scheduled, ctrl-c to stop");
                tokio::signal::ctrl_c()
                    .await
                    .context("waiting for ctrl-c")?;
                sched.shutdown().await.context("stopping scheduler")?;
            } else {
                let report = run_retention(store.as_ref(), days, dry_run).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Commands::Status { job_id } => {
            let store = persistent_store(&config).await?;
            match store.get_job(&job_id).await? {
                Some(log) => println!("{}", serde_json::to_string_pretty(&log)?),
                None => anyhow::bail!("job {job_id} not found"),
            }
        }
        Commands::Reports {
            branch,
            pos,
            date,
            job,
            page,
            limit,
        } => {
            let store = persistent_store(&config).await?;
            let filter = ReportFilter {
                branch,
                pos,
                work_date: date,
                source_file: None,
                job_id: job,
            };
            let found = store.find_reports(&filter, page, limit).await?;
            info!(
                total = found.total,
                page = found.page,
                page_size = found.page_size,
                "reports"
            );
            for row in &found.items {
                println!("{}", serde_json::to_string(row)?);
            }
        }
        Commands::Export {
            out,
            branch,
            pos,
            date,
            job,
            columns,
            gzip,
        } => {
            let store = persistent_store(&config).await?;
            let options = ExportOptions {
                filter: ReportFilter {
                    branch,
                    pos,
                    work_date: date,
                    source_file: None,
                    job_id: job,
                },
                columns,
                gzip,
            };
            let summary = export_reports(store.as_ref(), &out, &options)
                .await
                .with_context(|| format!("exporting to {}", out.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::ResetClaim {
            branch,
            pos,
            date,
            source_file,
        } => {
            let store = persistent_store(&config).await?;
            let identity = FileIdentity::new(branch, pos, date, source_file);
            let changed = ClaimTracker::new(store, config.dedupe)
                .reset(&identity)
                .await?;
            println!(
                "{identity}: {}",
                if changed { "reset to raw" } else { "nothing to reset" }
            );
        }
        Commands::Migrate => {
            connect_store(&config).await?;
            println!("schema ready");
        }
    }

    Ok(())
}
