//! Reference lookups built from the small companion CSVs of an export group.
//!
//! Every map keeps the first row seen for a key; later duplicates are ignored.
//! A missing companion file simply leaves its map empty.

use std::collections::HashMap;
use std::path::Path;

use posfeed_core::normalize_value;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{CombineError, ExportGroup, FileKind};

/// Which item-catalog layout a branch exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cohort {
    /// Catalog rows carry a department-code override.
    New,
    #[default]
    Legacy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemEntry {
    pub name: String,
    pub department_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupSet {
    pub items: HashMap<String, ItemEntry>,
    pub departments: HashMap<String, String>,
    pub discounts: HashMap<String, String>,
    pub payment_codes: HashMap<String, String>,
    pub payment_names: HashMap<String, String>,
    pub phones: HashMap<String, String>,
}

/// Strip an Excel text guard such as `="00123"` down to `00123`.
pub fn strip_excel_wrapper(value: &str) -> String {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix("=\"")
        .map(|rest| rest.strip_suffix('"').unwrap_or(rest))
        .or_else(|| trimmed.strip_prefix('='))
        .unwrap_or(trimmed);
    inner.trim_matches('"').trim().to_string()
}

fn column(record: &[String], index: usize) -> &str {
    record.get(index).map(String::as_str).unwrap_or_default()
}

/// Read every record of a headerless, possibly ragged CSV into normalized strings.
pub(crate) fn read_rows(path: &Path) -> Result<Vec<Vec<String>>, CombineError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| CombineError::csv(path, e))?;

    let mut rows = Vec::new();
    for (index, result) in reader.byte_records().enumerate() {
        match result {
            Ok(record) => {
                let row: Vec<String> = record
                    .iter()
                    .map(|field| normalize_value(&String::from_utf8_lossy(field)))
                    .collect();
                if row.iter().any(|f| !f.is_empty()) {
                    rows.push(row);
                }
            }
            Err(err) if err.is_io_error() => return Err(CombineError::csv(path, err)),
            Err(err) => {
                warn!(file = %path.display(), row = index, error = %err, "skipping unreadable lookup row");
            }
        }
    }
    Ok(rows)
}

fn first_wins<V>(map: &mut HashMap<String, V>, key: &str, value: V) {
    if key.is_empty() {
        return;
    }
    map.entry(key.to_string()).or_insert(value);
}

impl LookupSet {
    /// Build the lookups for one export group.
    pub fn for_group(group: &ExportGroup, cohort: Cohort) -> Result<Self, CombineError> {
        let mut set = LookupSet::default();
        for kind in FileKind::ALL {
            if kind == FileKind::Transactions {
                continue;
            }
            match group.path(kind) {
                Some(path) => set.load(kind, path, cohort)?,
                None => debug!(group = %group.key, kind = kind.token(), "lookup file absent"),
            }
        }
        Ok(set)
    }

    /// Build lookups from every marker-named file directly inside `dir`.
    pub fn from_dir(dir: &Path, cohort: Cohort) -> Result<Self, CombineError> {
        let mut set = LookupSet::default();
        if !dir.is_dir() {
            return Ok(set);
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| CombineError::io(dir, e))? {
            let entry = entry.map_err(|e| CombineError::io(dir, e))?;
            if entry.file_type().map_err(|e| CombineError::io(dir, e))?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        for path in paths {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            match FileKind::detect(name) {
                Some(FileKind::Transactions) | None => continue,
                Some(kind) => set.load(kind, &path, cohort)?,
            }
        }
        Ok(set)
    }

    fn load(&mut self, kind: FileKind, path: &Path, cohort: Cohort) -> Result<(), CombineError> {
        let rows = read_rows(path)?;
        debug!(file = %path.display(), kind = kind.token(), rows = rows.len(), "loading lookup");
        for row in &rows {
            match kind {
                FileKind::ItemCatalog => {
                    let department_code = match cohort {
                        Cohort::New if row.len() > 12 => Some(column(row, 12).to_string()),
                        Cohort::New if row.len() > 3 => Some(column(row, 3).to_string()),
                        _ => None,
                    }
                    .filter(|code| !code.is_empty());
                    first_wins(
                        &mut self.items,
                        column(row, 0),
                        ItemEntry {
                            name: column(row, 1).to_string(),
                            department_code,
                        },
                    );
                }
                FileKind::Departments => {
                    first_wins(&mut self.departments, column(row, 0), column(row, 1).to_string())
                }
                FileKind::Discounts => {
                    first_wins(&mut self.discounts, column(row, 0), column(row, 1).to_string())
                }
                FileKind::PaymentNames => first_wins(
                    &mut self.payment_names,
                    column(row, 0),
                    column(row, 1).to_string(),
                ),
                FileKind::PaymentCodes if row.len() >= 21 => first_wins(
                    &mut self.payment_codes,
                    column(row, 20),
                    column(row, 11).to_string(),
                ),
                FileKind::Phones if row.len() > 3 && column(row, 1).chars().count() == 11 => {
                    first_wins(
                        &mut self.phones,
                        &strip_excel_wrapper(column(row, 3)),
                        column(row, 1).to_string(),
                    )
                }
                FileKind::PaymentCodes | FileKind::Phones | FileKind::Transactions => {}
            }
        }
        Ok(())
    }

    pub fn item(&self, code: &str) -> Option<&ItemEntry> {
        self.items.get(code)
    }

    pub fn department_name(&self, code: &str) -> &str {
        lookup_str(&self.departments, code)
    }

    pub fn discount_name(&self, code: &str) -> &str {
        lookup_str(&self.discounts, code)
    }

    pub fn payment_code(&self, transaction: &str) -> &str {
        lookup_str(&self.payment_codes, transaction)
    }

    pub fn payment_name(&self, code: &str) -> &str {
        lookup_str(&self.payment_names, code)
    }

    pub fn phone(&self, transaction: &str) -> &str {
        lookup_str(&self.phones, transaction)
    }
}

fn lookup_str<'a>(map: &'a HashMap<String, String>, key: &str) -> &'a str {
    if key.is_empty() {
        return "";
    }
    map.get(key).map(String::as_str).unwrap_or_default()
}
