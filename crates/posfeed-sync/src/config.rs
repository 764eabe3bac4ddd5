use std::path::PathBuf;
use std::time::Duration;

use posfeed_core::DedupePolicy;
use posfeed_storage::{BackoffPolicy, HttpClientConfig};
use thiserror::Error;

use crate::listing::{ListMethod, ListingConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,
    #[error("invalid value `{value}` for {var}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub artifacts_dir: PathBuf,
    pub batch_size: usize,
    pub file_retries: usize,
    pub retry_base: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub dedupe: DedupePolicy,
    pub list_url: Option<String>,
    pub list_method: ListMethod,
    pub file_url_template: Option<String>,
    pub file_base_url: Option<String>,
    pub positions: Vec<u32>,
    pub branches: Vec<String>,
    pub backup_retention_days: i64,
    pub retention_cron: String,
    pub last_record_log: PathBuf,
    pub combine_out: PathBuf,
    pub header_template: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; unset and blank values take the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let workspace_root = var("POSFEED_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let dedupe = match var("POSFEED_DEDUPE") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: "POSFEED_DEDUPE",
                value,
            })?,
            None => DedupePolicy::Skip,
        };
        let list_method = match var("POSFEED_LIST_METHOD") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: "POSFEED_LIST_METHOD",
                value,
            })?,
            None => ListMethod::Post,
        };

        Ok(Self {
            database_url: var("DATABASE_URL"),
            artifacts_dir: var("POSFEED_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./latest")),
            batch_size: number("POSFEED_BATCH_SIZE", 1000).max(1) as usize,
            file_retries: number("POSFEED_FILE_RETRIES", 3).max(1) as usize,
            retry_base: Duration::from_millis(number("POSFEED_RETRY_BASE_MS", 500)),
            http_timeout: Duration::from_secs(number("POSFEED_HTTP_TIMEOUT_SECS", 60)),
            user_agent: var("POSFEED_USER_AGENT").unwrap_or_else(|| "posfeed/0.1".to_string()),
            dedupe,
            list_url: var("POSFEED_LIST_URL"),
            list_method,
            file_url_template: var("POSFEED_FILE_URL_TEMPLATE"),
            file_base_url: var("POSFEED_FILE_BASE_URL"),
            positions: parse_positions(&var("POSFEED_POSITIONS").unwrap_or_else(|| "1,2".into())),
            branches: var("POSFEED_BRANCHES")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            backup_retention_days: number("POSFEED_BACKUP_RETENTION_DAYS", 90) as i64,
            retention_cron: var("POSFEED_RETENTION_CRON")
                .unwrap_or_else(|| "0 0 3 * * *".to_string()),
            last_record_log: var("POSFEED_LAST_RECORD_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("last_record.log")),
            combine_out: var("POSFEED_COMBINE_OUT")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("record.csv")),
            header_template: var("POSFEED_HEADER_TEMPLATE")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("headers.csv")),
            workspace_root,
        })
    }

    /// Fatal at startup for any command that touches persistence.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("branches.yaml")
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.file_retries,
            base_delay: self.retry_base,
            ..BackoffPolicy::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            backoff: self.backoff(),
            ..HttpClientConfig::default()
        }
    }

    pub fn listing(&self) -> ListingConfig {
        ListingConfig {
            list_url: self.list_url.clone(),
            method: self.list_method,
            file_url_template: self.file_url_template.clone(),
            file_base_url: self.file_base_url.clone(),
        }
    }
}

pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Comma-separated terminal numbers; entries that are not numbers are dropped.
pub fn parse_positions(value: &str) -> Vec<u32> {
    split_list(value)
        .iter()
        .filter_map(|v| v.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.file_retries, 3);
        assert_eq!(cfg.retry_base, Duration::from_millis(500));
        assert_eq!(cfg.positions, vec![1, 2]);
        assert_eq!(cfg.dedupe, DedupePolicy::Skip);
        assert_eq!(cfg.list_method, ListMethod::Post);
        assert_eq!(cfg.last_record_log, PathBuf::from("./last_record.log"));
        assert!(matches!(
            cfg.require_database_url(),
            Err(ConfigError::MissingDatabaseUrl)
        ));
    }

    #[test]
    fn overrides_are_read_and_paths_follow_the_root() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://localhost/pos"),
            ("POSFEED_WORKSPACE_ROOT", "/srv/pos"),
            ("POSFEED_BATCH_SIZE", "250"),
            ("POSFEED_DEDUPE", "replace"),
            ("POSFEED_LIST_METHOD", "get"),
            ("POSFEED_POSITIONS", "1, 3,x"),
            ("POSFEED_BRANCHES", "A, B,,C"),
            ("POSFEED_FILE_RETRIES", "nope"),
        ])
        .unwrap();
        assert_eq!(cfg.require_database_url().unwrap(), "postgres://localhost/pos");
        assert_eq!(cfg.batch_size, 250);
        assert_eq!(cfg.file_retries, 3);
        assert_eq!(cfg.dedupe, DedupePolicy::Replace);
        assert_eq!(cfg.list_method, ListMethod::Get);
        assert_eq!(cfg.positions, vec![1, 3]);
        assert_eq!(cfg.branches, vec!["A", "B", "C"]);
        assert_eq!(cfg.combine_out, PathBuf::from("/srv/pos/record.csv"));
        assert_eq!(cfg.registry_path(), PathBuf::from("/srv/pos/branches.yaml"));
        assert_eq!(cfg.backoff().max_attempts, 3);
    }

    #[test]
    fn unknown_dedupe_policy_is_rejected() {
        let err = config(&[("POSFEED_DEDUPE", "overwrite")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "POSFEED_DEDUPE", .. }));
    }
}
