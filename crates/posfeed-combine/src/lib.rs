//! Lookup joins over downloaded POS exports.
//!
//! Exports are named `<prefix>_<branch>_<pos>_<filetype>_<date>_...csv`. Files sharing a
//! (branch, pos, date) form a group; every group with a transactions file is enriched
//! against the lookups found next to it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use posfeed_storage::StoreError;
use thiserror::Error;
use tracing::{debug, warn};

pub mod engine;
pub mod enrich;
pub mod lookup;

pub use engine::{CombineOptions, CombineSummary, Combiner};
pub use enrich::{daypart, transaction_type, EnrichedRow, RECORD_HEADERS};
pub use lookup::{strip_excel_wrapper, Cohort, ItemEntry, LookupSet};

pub const CRATE_NAME: &str = "posfeed-combine";

#[derive(Debug, Error)]
pub enum CombineError {
    #[error("workdir not found: {0}")]
    WorkdirMissing(PathBuf),
    #[error("group {0} has no transactions file")]
    NoTransactions(GroupKey),
    #[error("invalid pos `{0}` in export name")]
    InvalidPos(String),
    #[error("invalid date `{0}` in export name")]
    InvalidDate(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl CombineError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        CombineError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn csv(path: &Path, source: csv::Error) -> Self {
        CombineError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Companion file kinds, identified by a filetype token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileKind {
    Transactions,
    ItemCatalog,
    Departments,
    Discounts,
    PaymentCodes,
    PaymentNames,
    Phones,
}

impl FileKind {
    pub const ALL: [FileKind; 7] = [
        FileKind::Transactions,
        FileKind::ItemCatalog,
        FileKind::Departments,
        FileKind::Discounts,
        FileKind::PaymentCodes,
        FileKind::PaymentNames,
        FileKind::Phones,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            FileKind::Transactions => "rd5000",
            FileKind::ItemCatalog => "rd5500",
            FileKind::Departments => "rd1800",
            FileKind::Discounts => "discount",
            FileKind::PaymentCodes => "rd5800",
            FileKind::PaymentNames => "rd5900",
            FileKind::Phones => "blpr",
        }
    }

    /// Match a filetype token or any name containing one.
    pub fn detect(text: &str) -> Option<FileKind> {
        let lower = text.to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| lower == kind.token())
            .or_else(|| {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|kind| lower.contains(kind.token()))
            })
    }
}

/// Tokens pulled out of an export filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportName {
    pub branch: String,
    pub pos: String,
    pub filetype: String,
    pub date: String,
}

impl ExportName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = match file_name.len().checked_sub(4) {
            Some(cut)
                if file_name.is_char_boundary(cut)
                    && file_name[cut..].eq_ignore_ascii_case(".csv") =>
            {
                &file_name[..cut]
            }
            _ => file_name,
        };
        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() < 5 {
            return None;
        }
        Some(Self {
            branch: parts[1].to_string(),
            pos: parts[2].to_string(),
            filetype: parts[3].to_string(),
            date: parts[4].to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub branch: String,
    pub pos: String,
    pub date: String,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.branch, self.pos, self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportGroup {
    pub key: GroupKey,
    pub files: BTreeMap<FileKind, PathBuf>,
}

impl ExportGroup {
    pub fn path(&self, kind: FileKind) -> Option<&Path> {
        self.files.get(&kind).map(PathBuf::as_path)
    }

    pub fn transactions(&self) -> Option<&Path> {
        self.path(FileKind::Transactions)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), CombineError> {
    let entries = std::fs::read_dir(dir).map_err(|e| CombineError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CombineError::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| CombineError::io(&path, e))?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Walk `workdir` recursively and group export files by (branch, pos, date).
///
/// Names that do not follow the convention or carry no known filetype are ignored.
/// When two files claim the same slot the lexically first path wins.
pub fn group_workdir(workdir: &Path) -> Result<Vec<ExportGroup>, CombineError> {
    if !workdir.is_dir() {
        return Err(CombineError::WorkdirMissing(workdir.to_path_buf()));
    }
    let mut paths = Vec::new();
    collect_files(workdir, &mut paths)?;
    paths.sort();

    let mut groups: BTreeMap<GroupKey, BTreeMap<FileKind, PathBuf>> = BTreeMap::new();
    for path in paths {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(name) = ExportName::parse(file_name) else {
            debug!(file = file_name, "skipping file outside naming convention");
            continue;
        };
        let Some(kind) = FileKind::detect(&name.filetype) else {
            debug!(file = file_name, filetype = %name.filetype, "unknown filetype");
            continue;
        };
        let key = GroupKey {
            branch: name.branch,
            pos: name.pos,
            date: name.date,
        };
        let slots = groups.entry(key.clone()).or_default();
        if let Some(existing) = slots.get(&kind) {
            warn!(group = %key, kept = %existing.display(), ignored = %path.display(), "duplicate export");
            continue;
        }
        slots.insert(kind, path);
    }

    Ok(groups
        .into_iter()
        .map(|(key, files)| ExportGroup { key, files })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn export_names_split_on_underscores() {
        let name = ExportName::parse("a_AYALA-FRN_2_rd5000_2025-07-01_x.CSV").unwrap();
        assert_eq!(name.branch, "AYALA-FRN");
        assert_eq!(name.pos, "2");
        assert_eq!(name.filetype, "rd5000");
        assert_eq!(name.date, "2025-07-01");
        assert!(ExportName::parse("a_B_1_rd5000.csv").is_none());
    }

    #[test]
    fn filetype_detection_prefers_exact_tokens() {
        assert_eq!(FileKind::detect("RD5500"), Some(FileKind::ItemCatalog));
        assert_eq!(FileKind::detect("discount"), Some(FileKind::Discounts));
        assert_eq!(FileKind::detect("xblprx"), Some(FileKind::Phones));
        assert_eq!(FileKind::detect("rd9999"), None);
    }

    #[test]
    fn workdir_groups_by_branch_pos_date_recursively() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("AYALA/2025-07-01/1");
        std::fs::create_dir_all(&nested).unwrap();
        for name in [
            "x_AYALA_1_rd5000_2025-07-01_.csv",
            "x_AYALA_1_rd5500_2025-07-01_.csv",
            "x_AYALA_2_rd5000_2025-07-01_.csv",
        ] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        std::fs::write(nested.join("x_AYALA_1_blpr_2025-07-01_.csv"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let groups = group_workdir(dir.path()).unwrap();
        assert_eq!(groups.len(), 2);
        let first = &groups[0];
        assert_eq!(first.key.pos, "1");
        assert!(first.transactions().is_some());
        assert!(first.path(FileKind::ItemCatalog).is_some());
        assert!(first.path(FileKind::Phones).is_some());
        assert!(first.path(FileKind::Departments).is_none());
    }

    #[test]
    fn missing_workdir_is_an_error() {
        let dir = tempdir().unwrap();
        let err = group_workdir(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, CombineError::WorkdirMissing(_)));
    }
}
