//! Missing-date scanner over the local artifact tree.
//!
//! The tree is laid out as `<branch>/<YYYY-MM-DD>/...`; date-bearing filenames directly
//! under a branch directory also count. For every terminal the scanner infers which
//! weekdays it operates and lists the operating days in range that have no file.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

const SAMPLE_MAX_ROWS: usize = 500;
const SAMPLE_MAX_DATES: usize = 200;
const MIN_OBSERVED_DATES: usize = 3;
const DEFAULT_LOOKBACK_DAYS: i64 = 30;
const ALL_WEEKDAYS: [u32; 7] = [0, 1, 2, 3, 4, 5, 6];

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub workdir: PathBuf,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    /// Restrict to these branches; otherwise every branch directory found.
    pub branches: Vec<String>,
    /// Restrict to these terminals; otherwise every terminal seen for the branch.
    pub positions: Vec<u32>,
    /// A transaction export whose dates show the usual operating weekdays.
    pub sample_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingEntry {
    pub branch: String,
    pub pos: u32,
    pub existing_dates: Vec<NaiveDate>,
    pub existing_count: usize,
    /// 0 = Sunday.
    pub operating_weekdays: Vec<u32>,
    pub missing_dates: Vec<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingReport {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub results: Vec<MissingEntry>,
}

impl MissingReport {
    /// Missing dates keyed by branch then terminal, the shape a `missing` job takes.
    pub fn branches_missing(&self) -> BTreeMap<String, BTreeMap<u32, Vec<NaiveDate>>> {
        let mut out: BTreeMap<String, BTreeMap<u32, Vec<NaiveDate>>> = BTreeMap::new();
        for entry in self.results.iter().filter(|e| !e.missing_dates.is_empty()) {
            out.entry(entry.branch.clone())
                .or_default()
                .insert(entry.pos, entry.missing_dates.clone());
        }
        out
    }
}

struct Patterns {
    date_dir: Regex,
    date_in_name: Regex,
    pos_marker: Regex,
    pos_token: Regex,
    slash_date: Regex,
}

impl Patterns {
    fn compile() -> Result<Self> {
        Ok(Self {
            date_dir: Regex::new(r"^\d{4}-\d{2}-\d{2}$")?,
            date_in_name: Regex::new(r"(\d{4}-\d{2}-\d{2})")?,
            pos_marker: Regex::new(r"(?i)pos[_-]?(\d{1,3})")?,
            pos_token: Regex::new(r"_(\d{1,3})_")?,
            slash_date: Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{4})")?,
        })
    }

    fn pos_from_name(&self, name: &str) -> Option<u32> {
        self.pos_marker
            .captures(name)
            .or_else(|| self.pos_token.captures(name))
            .and_then(|caps| caps[1].parse().ok())
    }

    fn date_from_name(&self, name: &str) -> Option<NaiveDate> {
        self.date_in_name
            .captures(name)
            .and_then(|caps| NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok())
    }

    /// ISO dates anywhere in the cell, else `m/d/yyyy`.
    fn date_from_cell(&self, cell: &str) -> Option<NaiveDate> {
        self.date_from_name(cell).or_else(|| {
            let caps = self.slash_date.captures(cell)?;
            NaiveDate::from_ymd_opt(
                caps[3].parse().ok()?,
                caps[1].parse().ok()?,
                caps[2].parse().ok()?,
            )
        })
    }
}

type Observed = BTreeMap<String, BTreeMap<u32, BTreeSet<NaiveDate>>>;

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn files_under(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
        let name = entry.file_name();
        if is_hidden(&name.to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            files_under(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn scan_workdir(workdir: &Path, patterns: &Patterns) -> Result<Observed> {
    let mut observed = Observed::new();
    if !workdir.is_dir() {
        debug!(workdir = %workdir.display(), "workdir absent, nothing observed");
        return Ok(observed);
    }

    for branch_entry in
        std::fs::read_dir(workdir).with_context(|| format!("reading {}", workdir.display()))?
    {
        let branch_entry = branch_entry?;
        if !branch_entry.file_type()?.is_dir() {
            continue;
        }
        let branch = branch_entry.file_name().to_string_lossy().into_owned();
        if is_hidden(&branch) {
            continue;
        }
        let branch_dir = branch_entry.path();

        for entry in std::fs::read_dir(&branch_dir)
            .with_context(|| format!("reading {}", branch_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_hidden(&name) {
                continue;
            }
            let file_type = entry.file_type()?;

            if file_type.is_dir() && patterns.date_dir.is_match(&name) {
                let Ok(date) = NaiveDate::parse_from_str(&name, "%Y-%m-%d") else {
                    continue;
                };
                let date_dir = entry.path();
                let mut files = Vec::new();
                files_under(&date_dir, &mut files)?;
                for file in files {
                    let pos = pos_for_file(&date_dir, &file, patterns);
                    observed
                        .entry(branch.clone())
                        .or_default()
                        .entry(pos)
                        .or_default()
                        .insert(date);
                }
            } else if file_type.is_file() {
                if let Some(date) = patterns.date_from_name(&name) {
                    let pos = patterns.pos_from_name(&name).unwrap_or(1);
                    observed
                        .entry(branch.clone())
                        .or_default()
                        .entry(pos)
                        .or_default()
                        .insert(date);
                }
            }
        }
    }
    Ok(observed)
}

/// A numeric directory right under the date names the terminal; else the filename does.
fn pos_for_file(date_dir: &Path, file: &Path, patterns: &Patterns) -> u32 {
    let relative = file.strip_prefix(date_dir).unwrap_or(file);
    let mut parts = relative.components();
    if let (Some(first), Some(_)) = (parts.next(), parts.next()) {
        if let Ok(pos) = first.as_os_str().to_string_lossy().parse::<u32>() {
            return pos;
        }
    }
    file.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| patterns.pos_from_name(n))
        .unwrap_or(1)
}

fn weekdays_of<'a>(dates: impl IntoIterator<Item = &'a NaiveDate>) -> Vec<u32> {
    let set: BTreeSet<u32> = dates
        .into_iter()
        .map(|d| d.weekday().num_days_from_sunday())
        .collect();
    set.into_iter().collect()
}

fn sample_weekdays(path: &Path, patterns: &Patterns) -> Option<Vec<u32>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .ok()?;
    let mut dates = Vec::new();
    for record in reader.records().take(SAMPLE_MAX_ROWS) {
        let Ok(record) = record else { continue };
        if let Some(date) = record.iter().find_map(|cell| patterns.date_from_cell(cell)) {
            dates.push(date);
        }
    }
    if dates.is_empty() {
        return None;
    }
    dates.truncate(SAMPLE_MAX_DATES);
    Some(weekdays_of(&dates))
}

fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .collect()
}

/// Scan the artifact tree; `today` anchors the default range.
pub fn scan(options: &ScanOptions, today: NaiveDate) -> Result<MissingReport> {
    let patterns = Patterns::compile().context("compiling scanner patterns")?;
    let start = options
        .start
        .unwrap_or(today - Duration::days(DEFAULT_LOOKBACK_DAYS));
    let end = options.end.unwrap_or(today);
    let all_dates = date_range(start, end);

    let observed = scan_workdir(&options.workdir, &patterns)?;
    let sampled = options
        .sample_file
        .as_deref()
        .and_then(|path| sample_weekdays(path, &patterns));

    let branches: Vec<String> = if options.branches.is_empty() {
        observed.keys().cloned().collect()
    } else {
        options.branches.clone()
    };

    let mut results = Vec::new();
    for branch in branches {
        let seen = observed.get(&branch);
        let positions: Vec<u32> = if !options.positions.is_empty() {
            options.positions.clone()
        } else {
            match seen {
                Some(map) if !map.is_empty() => map.keys().copied().collect(),
                _ => vec![1],
            }
        };

        for pos in positions {
            let existing: Vec<NaiveDate> = seen
                .and_then(|map| map.get(&pos))
                .map(|dates| dates.iter().copied().collect())
                .unwrap_or_default();

            let operating_weekdays = match &sampled {
                Some(weekdays) if !weekdays.is_empty() => weekdays.clone(),
                _ if existing.len() >= MIN_OBSERVED_DATES => weekdays_of(&existing),
                _ => ALL_WEEKDAYS.to_vec(),
            };
            let missing_dates = all_dates
                .iter()
                .filter(|d| operating_weekdays.contains(&d.weekday().num_days_from_sunday()))
                .filter(|d| existing.binary_search(d).is_err())
                .copied()
                .collect();

            results.push(MissingEntry {
                branch: branch.clone(),
                pos,
                existing_count: existing.len(),
                existing_dates: existing,
                operating_weekdays,
                missing_dates,
            });
        }
    }

    Ok(MissingReport {
        start,
        end,
        results,
    })
}
