// ── File auto-download ──
//
// Fetches files referenced by URL inside a polled item and archives
// them under a local directory. At most two downloads are in flight
// across one controller.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldlink_api::RestClient;
use futures_util::future::try_join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::CoreError;

/// Per-file request timeout.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_millis(1500);

/// Archive layout: instance key, UTC date, UTC time, URL extension.
pub const DEFAULT_FILENAME: &str = "{key}/{date}/{time}.{ext}";

const DOWNLOAD_CONCURRENCY: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub archive_dir: PathBuf,
    /// Relative target path. `{key}`, `{date}`, `{time}`, `{ext}` and
    /// `{index}` are substituted.
    pub filename: String,
    pub timeout: Duration,
}

impl DownloadOptions {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            filename: DEFAULT_FILENAME.into(),
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    /// Target names for each URL, in order.
    pub fn targets(&self, key: &str, urls: &[String], now: DateTime<Utc>) -> Vec<String> {
        let date = now.format("%Y%m%d").to_string();
        let time = now.format("%H%M%S").to_string();
        urls.iter()
            .enumerate()
            .map(|(index, url)| {
                self.filename
                    .replace("{key}", key)
                    .replace("{date}", &date)
                    .replace("{time}", &time)
                    .replace("{ext}", extension(url))
                    .replace("{index}", &index.to_string())
            })
            .collect()
    }
}

/// Every `http://` or `https://` string anywhere in `item`.
pub fn file_urls(item: &Value) -> Vec<String> {
    let mut urls = Vec::new();
    collect_urls(item, &mut urls);
    urls
}

fn collect_urls(value: &Value, urls: &mut Vec<String>) {
    match value {
        Value::String(s) if s.starts_with("http://") || s.starts_with("https://") => {
            urls.push(s.clone());
        }
        Value::Array(items) => items.iter().for_each(|v| collect_urls(v, urls)),
        Value::Object(fields) => fields.values().for_each(|v| collect_urls(v, urls)),
        _ => {}
    }
}

/// Extension of the URL's last path segment, `jpg` when there is none.
fn extension(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
        _ => "jpg",
    }
}

pub struct Downloader {
    client: RestClient,
    options: DownloadOptions,
    permits: Semaphore,
}

impl Downloader {
    pub fn new(client: RestClient, options: DownloadOptions) -> Self {
        Self {
            client,
            options,
            permits: Semaphore::new(DOWNLOAD_CONCURRENCY),
        }
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Download every `(url, target)` pair. Fails on the first error.
    pub async fn fetch_all(&self, files: &[(String, String)]) -> Result<(), CoreError> {
        try_join_all(files.iter().map(|(url, target)| self.fetch(url, target))).await?;
        Ok(())
    }

    pub async fn fetch(&self, url: &str, target: &str) -> Result<(), CoreError> {
        let path = self.archive_path(target)?;
        let _permit = self.permits.acquire().await.map_err(|_| CoreError::QueueClosed)?;

        let body = self.client.download(url, self.options.timeout).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| archive_error(target, &e))?;
        }
        tokio::fs::write(&path, &body)
            .await
            .map_err(|e| archive_error(target, &e))?;
        debug!(%url, target, bytes = body.len(), "file archived");
        Ok(())
    }

    /// `target` under the archive directory. Absolute targets and parent
    /// references are refused.
    fn archive_path(&self, target: &str) -> Result<PathBuf, CoreError> {
        let relative = Path::new(target);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(CoreError::Download {
                target: target.to_owned(),
                reason: "target escapes the archive directory".into(),
            });
        }
        Ok(self.options.archive_dir.join(relative))
    }
}

fn archive_error(target: &str, e: &std::io::Error) -> CoreError {
    CoreError::Download {
        target: target.to_owned(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn urls_are_found_at_any_depth() {
        let item = json!({
            "id": "CAM1",
            "dynamics": [{ "image": "https://cams.example/a1.jpg", "note": "ftp://x" }],
            "thumb": "http://cams.example/a1-small.png",
        });
        let mut urls = file_urls(&item);
        urls.sort();
        assert_eq!(urls, vec!["http://cams.example/a1-small.png", "https://cams.example/a1.jpg"]);
    }

    #[test]
    fn targets_follow_the_filename_layout() {
        let options = DownloadOptions::new("/archive");
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 7).unwrap();
        let urls = vec![
            "https://cams.example/feeds/a1.png?size=large".to_owned(),
            "https://cams.example/feeds/latest".to_owned(),
        ];
        assert_eq!(
            options.targets("CAM1", &urls, now),
            vec!["CAM1/20240301/090507.png", "CAM1/20240301/090507.jpg"]
        );
    }

    #[test]
    fn targets_outside_the_archive_are_refused() {
        let client = RestClient::new(fieldlink_api::RestClientConfig::new(
            "http://localhost".parse().unwrap(),
        ))
        .unwrap();
        let downloader = Downloader::new(client, DownloadOptions::new("/archive"));
        assert!(downloader.archive_path("../etc/passwd").is_err());
        assert!(downloader.archive_path("/etc/passwd").is_err());
        assert_eq!(
            downloader.archive_path("CAM1/a.jpg").unwrap(),
            PathBuf::from("/archive/CAM1/a.jpg")
        );
    }
}
