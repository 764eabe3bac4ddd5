//! Full-dataset CSV export of stored report rows, optionally gzip-compressed.
//!
//! Pages are read from the store on the async side and handed to a blocking writer
//! over a bounded channel, so a slow disk pauses the reads instead of buffering them.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use posfeed_core::IngestedRow;
use posfeed_storage::{ReportFilter, Store, StoreError, MAX_PAGE_SIZE};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Row metadata written ahead of the field columns.
pub const EXPORT_META_COLUMNS: [&str; 4] = ["branch", "pos", "work_date", "source_file"];

/// Pages in flight between the reader and the writer.
const EXPORT_CHANNEL_PAGES: usize = 2;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("export writer failed: {0}")]
    Worker(String),
}

impl ExportError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub filter: ReportFilter,
    /// Field columns after the metadata. Empty takes the first row's fields in order.
    pub columns: Vec<String>,
    /// Compress even when the path does not end in `.gz`.
    pub gzip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub rows: u64,
    pub columns: Vec<String>,
    pub gzip: bool,
    /// Rows carrying fields outside `columns`; those values are not written.
    pub rows_with_unlisted_fields: u64,
}

#[derive(Debug, Default)]
struct WriteTally {
    rows: u64,
    columns: Vec<String>,
    rows_with_unlisted_fields: u64,
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    fn create(path: &Path, gzip: bool) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(if gzip {
            Sink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Sink::Plain(file)
        })
    }

    /// Flush everything, including the gzip trailer.
    fn finish(self) -> io::Result<()> {
        match self {
            Sink::Plain(mut file) => file.flush(),
            Sink::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

pub fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

fn partial_path(out: &Path) -> PathBuf {
    let mut name = out.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    out.with_file_name(name)
}

/// Write every row matching `options.filter` to `out`, newest work date first.
///
/// The file appears under its final name only once it is complete.
pub async fn export_reports(
    store: &dyn Store,
    out: &Path,
    options: &ExportOptions,
) -> Result<ExportSummary, ExportError> {
    let gzip = options.gzip || is_gzip_path(out);
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExportError::io(parent, e))?;
    }
    let partial = partial_path(out);

    let (tx, rx) = mpsc::channel::<Vec<IngestedRow>>(EXPORT_CHANNEL_PAGES);
    let writer = {
        let partial = partial.clone();
        let columns = options.columns.clone();
        tokio::task::spawn_blocking(move || write_export(&partial, gzip, columns, rx))
    };

    let fetched = fetch_pages(store, &options.filter, tx).await;
    let written = writer
        .await
        .map_err(|e| ExportError::Worker(e.to_string()))
        .and_then(|written| written);

    let tally = match fetched.and(written) {
        Ok(tally) => tally,
        Err(err) => {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %cleanup, "could not remove partial export");
                }
            }
            return Err(err);
        }
    };
    tokio::fs::rename(&partial, out)
        .await
        .map_err(|e| ExportError::io(out, e))?;

    if tally.rows_with_unlisted_fields > 0 {
        warn!(
            rows = tally.rows_with_unlisted_fields,
            "some rows carried fields outside the export columns"
        );
    }
    info!(path = %out.display(), rows = tally.rows, gzip, "report export written");
    Ok(ExportSummary {
        path: out.to_path_buf(),
        rows: tally.rows,
        columns: tally.columns,
        gzip,
        rows_with_unlisted_fields: tally.rows_with_unlisted_fields,
    })
}

/// Page through the store until the reported total is reached. Returns the row count sent.
async fn fetch_pages(
    store: &dyn Store,
    filter: &ReportFilter,
    tx: mpsc::Sender<Vec<IngestedRow>>,
) -> Result<u64, ExportError> {
    let mut sent = 0u64;
    let mut page_no = 1u64;
    loop {
        let page = store.find_reports(filter, page_no, MAX_PAGE_SIZE).await?;
        if page.items.is_empty() {
            break;
        }
        sent += page.items.len() as u64;
        if tx.send(page.items).await.is_err() {
            // The writer stopped; its error is the one worth reporting.
            break;
        }
        if sent >= page.total {
            break;
        }
        page_no += 1;
    }
    Ok(sent)
}

fn write_export(
    path: &Path,
    gzip: bool,
    columns: Vec<String>,
    mut rx: mpsc::Receiver<Vec<IngestedRow>>,
) -> Result<WriteTally, ExportError> {
    let sink = Sink::create(path, gzip).map_err(|e| ExportError::io(path, e))?;
    let mut writer = csv::Writer::from_writer(sink);

    let first = rx.blocking_recv();
    let columns = if columns.is_empty() {
        first
            .as_ref()
            .and_then(|page| page.first())
            .map(|row| row.data.keys().cloned().collect())
            .unwrap_or_default()
    } else {
        columns
    };
    let header = EXPORT_META_COLUMNS
        .iter()
        .copied()
        .chain(columns.iter().map(String::as_str));
    writer
        .write_record(header)
        .map_err(|e| ExportError::csv(path, e))?;

    let mut tally = WriteTally::default();
    let mut next = first;
    while let Some(page) = next {
        for row in &page {
            let mut record = vec![
                row.branch.clone(),
                row.pos.to_string(),
                row.work_date.format("%Y-%m-%d").to_string(),
                row.source_file.clone(),
            ];
            record.extend(
                columns
                    .iter()
                    .map(|column| row.data.get(column).map(|v| v.render()).unwrap_or_default()),
            );
            writer
                .write_record(&record)
                .map_err(|e| ExportError::csv(path, e))?;
            if row.data.keys().any(|key| !columns.contains(key)) {
                tally.rows_with_unlisted_fields += 1;
            }
            tally.rows += 1;
        }
        next = rx.blocking_recv();
    }

    let sink = writer
        .into_inner()
        .map_err(|e| ExportError::io(path, e.into_error()))?;
    sink.finish().map_err(|e| ExportError::io(path, e))?;
    tally.columns = columns;
    Ok(tally)
}
