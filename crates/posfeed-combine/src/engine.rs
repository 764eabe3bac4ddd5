//! Combine runs: enrich every export group and emit flat lines plus stored documents.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use posfeed_core::{EventBus, FieldMap, FileIdentity, IngestedRow, JobEvent};
use posfeed_storage::{BatchWriter, FlushReport, Store};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::enrich::{EnrichedRow, RECORD_HEADERS};
use crate::lookup::{Cohort, LookupSet};
use crate::{group_workdir, CombineError, ExportGroup};

/// Rows buffered between the parser thread and the inserter before the parser blocks.
pub const ROW_CHANNEL_CAPACITY: usize = 256;

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y%m%d"];

#[derive(Debug, Clone)]
pub struct CombineOptions {
    pub workdir: PathBuf,
    pub out_file: PathBuf,
    pub header_template: Option<PathBuf>,
    pub batch_size: usize,
    /// Branches exporting the newer item-catalog layout.
    pub new_branches: HashSet<String>,
}

impl CombineOptions {
    pub fn new(workdir: impl Into<PathBuf>, out_file: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            out_file: out_file.into(),
            header_template: None,
            batch_size: 1000,
            new_branches: HashSet::new(),
        }
    }

    pub fn cohort(&self, branch: &str) -> Cohort {
        if self.new_branches.contains(branch) {
            Cohort::New
        } else {
            Cohort::Legacy
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CombineSummary {
    pub groups_total: u64,
    pub groups_completed: u64,
    pub rows_written: u64,
    pub rows_inserted: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupOutcome {
    written: u64,
    inserted: u64,
}

pub struct Combiner {
    store: Arc<dyn Store>,
    events: EventBus,
    options: CombineOptions,
}

impl Combiner {
    pub fn new(store: Arc<dyn Store>, events: EventBus, options: CombineOptions) -> Self {
        Self {
            store,
            events,
            options,
        }
    }

    pub fn options(&self) -> &CombineOptions {
        &self.options
    }

    /// Combine every group under the workdir. Group failures are reported and skipped;
    /// only an unreadable workdir fails the run.
    pub async fn run(&self, job_id: &str) -> Result<CombineSummary, CombineError> {
        self.events.publish(JobEvent::Started {
            job_id: job_id.to_string(),
            message: format!(
                "combine started, workdir={}",
                self.options.workdir.display()
            ),
        });

        let groups = match group_workdir(&self.options.workdir) {
            Ok(groups) => groups,
            Err(err) => {
                self.events.publish(JobEvent::Error {
                    job_id: job_id.to_string(),
                    file: None,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };
        let groups: Vec<ExportGroup> = groups
            .into_iter()
            .filter(|group| group.transactions().is_some())
            .collect();

        let mut summary = CombineSummary {
            groups_total: groups.len() as u64,
            ..Default::default()
        };
        info!(job_id, groups = groups.len(), "combining export groups");

        for group in &groups {
            let file = group
                .transactions()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let span = info_span!("combine_group", job_id, group = %group.key);
            let result = async {
                let identity = group_identity(group)?;
                self.events.publish(JobEvent::FileStart {
                    job_id: job_id.to_string(),
                    branch: identity.branch.clone(),
                    pos: identity.pos,
                    date: group.key.date.clone(),
                    file: file.clone(),
                });
                self.combine_group(job_id, group, &identity).await
            }
            .instrument(span)
            .await;

            match result {
                Ok(outcome) => {
                    summary.groups_completed += 1;
                    summary.rows_written += outcome.written;
                    summary.rows_inserted += outcome.inserted;
                    self.events.publish(JobEvent::FileComplete {
                        job_id: job_id.to_string(),
                        file,
                        rows: outcome.inserted,
                        files_completed: summary.groups_completed,
                        files_total: summary.groups_total,
                    });
                }
                Err(err) => {
                    warn!(job_id, group = %group.key, error = %err, "combine group failed");
                    summary.errors.push(format!("{}: {err}", group.key));
                    self.events.publish(JobEvent::Error {
                        job_id: job_id.to_string(),
                        file: Some(file),
                        message: err.to_string(),
                    });
                }
            }
        }

        self.events.publish(JobEvent::Complete {
            job_id: job_id.to_string(),
            rows_inserted: summary.rows_inserted,
            files_completed: summary.groups_completed,
            files_total: summary.groups_total,
        });
        Ok(summary)
    }

    async fn combine_group(
        &self,
        job_id: &str,
        group: &ExportGroup,
        identity: &FileIdentity,
    ) -> Result<GroupOutcome, CombineError> {
        let source = group
            .transactions()
            .map(Path::to_path_buf)
            .ok_or_else(|| CombineError::NoTransactions(group.key.clone()))?;

        let cohort = self.options.cohort(&identity.branch);
        let lookups = {
            let group = group.clone();
            tokio::task::spawn_blocking(move || LookupSet::for_group(&group, cohort))
                .await
                .map_err(|e| CombineError::Worker(e.to_string()))??
        };

        prepare_output(
            &self.options.out_file,
            self.options.header_template.as_deref(),
        )?;

        let (tx, mut rx) = mpsc::channel::<FieldMap>(ROW_CHANNEL_CAPACITY);
        let parser = {
            let out = self.options.out_file.clone();
            let pos = group.key.pos.clone();
            let branch = identity.branch.clone();
            let source = source.clone();
            tokio::task::spawn_blocking(move || {
                stream_transactions(&source, &out, &pos, &branch, &lookups, tx)
            })
        };

        let mut batch = BatchWriter::new(self.store.clone(), self.options.batch_size);
        let file = source.display().to_string();
        let inserted = self
            .insert_rows(job_id, identity, &file, &mut rx, &mut batch)
            .await;
        // Unblocks the parser if inserting stopped early.
        drop(rx);

        let written = parser
            .await
            .map_err(|e| CombineError::Worker(e.to_string()))?;
        inserted?;
        let written = written?;

        debug!(written, inserted = batch.totals().inserted, "group combined");
        Ok(GroupOutcome {
            written,
            inserted: batch.totals().inserted,
        })
    }

    async fn insert_rows(
        &self,
        job_id: &str,
        identity: &FileIdentity,
        file: &str,
        rx: &mut mpsc::Receiver<FieldMap>,
        batch: &mut BatchWriter,
    ) -> Result<(), CombineError> {
        while let Some(fields) = rx.recv().await {
            let row = IngestedRow::from_fields(job_id, identity, fields, Utc::now());
            if let Some(report) = batch.push(row).await? {
                self.publish_progress(job_id, file, report);
            }
        }
        if let Some(report) = batch.finish().await? {
            self.publish_progress(job_id, file, report);
        }
        Ok(())
    }

    fn publish_progress(&self, job_id: &str, file: &str, report: FlushReport) {
        self.events.publish(JobEvent::Progress {
            job_id: job_id.to_string(),
            file: file.to_string(),
            batch_rows: report.batch_rows,
            total_rows: report.total_rows,
        });
    }
}

fn group_identity(group: &ExportGroup) -> Result<FileIdentity, CombineError> {
    let pos: u32 = group
        .key
        .pos
        .trim()
        .parse()
        .map_err(|_| CombineError::InvalidPos(group.key.pos.clone()))?;
    let work_date = DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(group.key.date.trim(), format).ok())
        .ok_or_else(|| CombineError::InvalidDate(group.key.date.clone()))?;
    let source_file = group
        .transactions()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| CombineError::NoTransactions(group.key.clone()))?;
    Ok(FileIdentity::new(
        group.key.branch.clone(),
        pos,
        work_date,
        source_file,
    ))
}

/// Make sure the output file exists and starts with a header line.
///
/// Returns true when a header was written. An existing non-empty file is left alone.
pub fn prepare_output(out: &Path, template: Option<&Path>) -> Result<bool, CombineError> {
    match std::fs::metadata(out) {
        Ok(meta) if meta.len() > 0 => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(CombineError::io(out, err)),
    }
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CombineError::io(parent, e))?;
    }

    match template.filter(|t| t.is_file()) {
        Some(template) => {
            std::fs::copy(template, out).map_err(|e| CombineError::io(template, e))?;
            ensure_trailing_newline(out)?;
        }
        None => {
            let mut writer = csv::Writer::from_path(out).map_err(|e| CombineError::csv(out, e))?;
            writer
                .write_record(RECORD_HEADERS)
                .map_err(|e| CombineError::csv(out, e))?;
            writer.flush().map_err(|e| CombineError::io(out, e))?;
        }
    }
    Ok(true)
}

fn ensure_trailing_newline(path: &Path) -> Result<(), CombineError> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| CombineError::io(path, e))?;
    let len = file.metadata().map_err(|e| CombineError::io(path, e))?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))
        .and_then(|_| file.read_exact(&mut last))
        .map_err(|e| CombineError::io(path, e))?;
    if last[0] != b'\n' {
        file.write_all(b"\n").map_err(|e| CombineError::io(path, e))?;
    }
    Ok(())
}

/// Parse, enrich and append one transactions file, handing each document to `tx`.
///
/// Runs on a blocking thread; a full channel blocks parsing until the inserter catches up.
fn stream_transactions(
    source: &Path,
    out: &Path,
    pos: &str,
    branch: &str,
    lookups: &LookupSet,
    tx: mpsc::Sender<FieldMap>,
) -> Result<u64, CombineError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(source)
        .map_err(|e| CombineError::csv(source, e))?;

    let output = OpenOptions::new()
        .create(true)
        .append(true)
        .open(out)
        .map_err(|e| CombineError::io(out, e))?;
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(output);

    let mut written = 0u64;
    for (index, result) in reader.byte_records().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(err) if err.is_io_error() => return Err(CombineError::csv(source, err)),
            Err(err) => {
                warn!(file = %source.display(), row = index, error = %err, "skipping malformed row");
                continue;
            }
        };
        let fields: Vec<String> = record
            .iter()
            .map(|field| String::from_utf8_lossy(field).into_owned())
            .collect();
        let Some(row) = EnrichedRow::from_record(&fields, pos, branch, lookups) else {
            continue;
        };

        writer
            .write_record(row.values())
            .map_err(|e| CombineError::csv(out, e))?;
        written += 1;

        if tx.blocking_send(row.fields()).is_err() {
            debug!(file = %source.display(), "row consumer stopped early");
            break;
        }
    }
    writer.flush().map_err(|e| CombineError::io(out, e))?;
    Ok(written)
}
