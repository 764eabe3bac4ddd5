//! Remote file listing and file URL resolution.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use posfeed_core::{FileIdentity, FileTarget};
use posfeed_storage::{FetchError, HttpFetcher};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Object keys that may carry a file reference, in order of preference.
const FILE_KEYS: [&str; 6] = ["url", "fileUrl", "path", "filename", "file", "name"];

#[derive(Debug, Error)]
#[error("unknown list method `{0}` (expected GET or POST)")]
pub struct UnknownListMethod(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListMethod {
    /// Parameters in the query string.
    Get,
    /// Parameters as a urlencoded form body.
    #[default]
    Post,
}

impl FromStr for ListMethod {
    type Err = UnknownListMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(ListMethod::Get),
            "POST" => Ok(ListMethod::Post),
            _ => Err(UnknownListMethod(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListingConfig {
    pub list_url: Option<String>,
    pub method: ListMethod,
    pub file_url_template: Option<String>,
    pub file_base_url: Option<String>,
}

/// Split a listing response into file references.
///
/// Plain text is a comma-separated list, an HTML page means the listing had nothing,
/// and JSON carries a `files` array (or is the array itself) of strings or objects.
pub fn parse_listing(body: &str) -> Vec<String> {
    let body = body.trim();
    if body.is_empty() {
        return Vec::new();
    }
    if body.starts_with('<') {
        debug!("listing returned html, treating as empty");
        return Vec::new();
    }
    if body.starts_with('{') || body.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            return json_files(&value);
        }
    }
    body.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn json_files(value: &Value) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("files") {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(map) => FILE_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_absolute(file: &str) -> bool {
    let lower = file.get(..8).unwrap_or(file).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Absolute URLs pass through; otherwise the template, then the base URL, is applied.
pub fn resolve_file_url(file: &str, config: &ListingConfig) -> Option<String> {
    let file = file.trim();
    if file.is_empty() {
        return None;
    }
    if is_absolute(file) {
        return Some(file.to_string());
    }
    if let Some(template) = &config.file_url_template {
        return Some(
            template
                .replace("{{file}}", file)
                .replace("{{ file }}", file)
                .replace("{filename}", file),
        );
    }
    config
        .file_base_url
        .as_ref()
        .map(|base| format!("{base}{file}"))
}

#[async_trait]
pub trait FileLister: Send + Sync {
    /// File references published for one terminal on one business date.
    async fn list(&self, branch: &str, pos: u32, date: NaiveDate) -> Result<Vec<String>, FetchError>;
}

pub struct HttpLister {
    fetcher: Arc<HttpFetcher>,
    url: String,
    method: ListMethod,
}

impl HttpLister {
    /// `None` when no listing endpoint is configured.
    pub fn from_config(fetcher: Arc<HttpFetcher>, config: &ListingConfig) -> Option<Self> {
        config.list_url.as_ref().map(|url| Self {
            fetcher,
            url: url.clone(),
            method: config.method,
        })
    }
}

#[async_trait]
impl FileLister for HttpLister {
    async fn list(&self, branch: &str, pos: u32, date: NaiveDate) -> Result<Vec<String>, FetchError> {
        let params = [
            ("branch", branch.to_string()),
            ("pos", pos.to_string()),
            ("date", date.format("%Y-%m-%d").to_string()),
        ];
        let body = self
            .fetcher
            .fetch_text(&self.url, |client| match self.method {
                ListMethod::Get => client.get(&self.url).query(&params),
                ListMethod::Post => client.post(&self.url).form(&params),
            })
            .await?;
        Ok(parse_listing(&body))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRequest {
    pub branch: String,
    pub pos: u32,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedFiles {
    pub targets: Vec<FileTarget>,
    /// Listing calls that failed; the other requests still resolve.
    pub errors: Vec<String>,
}

/// Ask the lister for every request and turn the answers into ingest targets.
pub async fn resolve_listed<I>(
    lister: &dyn FileLister,
    config: &ListingConfig,
    requests: I,
) -> ResolvedFiles
where
    I: IntoIterator<Item = ListingRequest>,
{
    let mut resolved = ResolvedFiles::default();
    for request in requests {
        let items = match lister.list(&request.branch, request.pos, request.date).await {
            Ok(items) => items,
            Err(err) => {
                warn!(branch = %request.branch, pos = request.pos, date = %request.date, error = %err, "listing failed");
                resolved.errors.push(format!(
                    "listing {}/{}/{}: {err}",
                    request.branch, request.pos, request.date
                ));
                continue;
            }
        };
        for item in items {
            let Some(url) = resolve_file_url(&item, config) else {
                warn!(item = %item, "cannot resolve file url, no template or base url");
                continue;
            };
            resolved.targets.push(FileTarget {
                identity: FileIdentity::new(
                    request.branch.clone(),
                    request.pos,
                    request.date,
                    url.clone(),
                ),
                url,
            });
        }
    }
    resolved
}
