//! The last-record log: a one-line file holding the date the next incremental fetch starts from.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate};
use tracing::warn;

fn parse_record(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.date_naive()))
        .or_else(|| {
            text.get(..10)
                .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        })
}

/// `None` when the log is absent, empty or unreadable as a date.
pub fn read_last_record(path: &Path) -> Result<Option<NaiveDate>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", path.display()));
        }
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    let parsed = parse_record(&text);
    if parsed.is_none() {
        warn!(path = %path.display(), "last-record log does not hold a date");
    }
    Ok(parsed)
}

pub fn write_last_record(path: &Path, date: NaiveDate) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, date.format("%Y-%m-%d").to_string())
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dates_round_trip_and_bad_logs_read_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/last_record.log");
        assert_eq!(read_last_record(&path).unwrap(), None);

        let date = NaiveDate::from_ymd_opt(2025, 7, 14).unwrap();
        write_last_record(&path, date).unwrap();
        assert_eq!(read_last_record(&path).unwrap(), Some(date));

        std::fs::write(&path, "2025-07-14T08:30:00Z\n").unwrap();
        assert_eq!(read_last_record(&path).unwrap(), Some(date));

        std::fs::write(&path, "  \n").unwrap();
        assert_eq!(read_last_record(&path).unwrap(), None);

        std::fs::write(&path, "yesterday").unwrap();
        assert_eq!(read_last_record(&path).unwrap(), None);
    }
}
