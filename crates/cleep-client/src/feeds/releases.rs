//! Flashing tool release feed.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use cleep_platform::HostOs;
use cleep_shared::constants::TOOL_RELEASES_URL;
use cleep_shared::types::ToolUpdate;

use super::fetch_releases;
use crate::download::cached_files;

static VERSION: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"v?(\d+(?:\.\d+)+)").ok());

/// Asset name fragment matching the running host.
pub fn asset_pattern(os: HostOs, arch: &str) -> Option<&'static str> {
    match (os, arch) {
        (HostOs::Linux, "x86_64") => Some("linux-x64"),
        (HostOs::Linux, "aarch64") => Some("linux-arm64"),
        (HostOs::MacOs, _) => Some("darwin"),
        (HostOs::Windows, "x86_64") => Some("win32-x64"),
        (HostOs::Windows, "x86") => Some("win32-x86"),
        _ => None,
    }
}

fn numbers(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split(['-', '+'])
        .next()
        .unwrap_or_default()
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

/// Whether `candidate` is strictly newer than `installed`. Anything is newer
/// than an empty version.
pub fn is_newer(candidate: &str, installed: &str) -> bool {
    if installed.trim().is_empty() {
        return !candidate.trim().is_empty();
    }
    let (a, b) = (numbers(candidate), numbers(installed));
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other == Ordering::Greater,
        }
    }
    false
}

fn version_in(name: &str) -> Option<String> {
    VERSION
        .as_ref()?
        .captures(name)?
        .get(1)
        .map(|m| m.as_str().to_string())
}

pub struct ToolFeed {
    url: String,
    pattern: Option<&'static str>,
    cache_dir: PathBuf,
}

impl ToolFeed {
    pub fn new(url: &str, pattern: Option<&'static str>, cache_dir: &Path) -> Self {
        Self {
            url: url.to_string(),
            pattern,
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    pub fn for_host(cache_dir: &Path) -> Self {
        Self::new(
            TOOL_RELEASES_URL,
            asset_pattern(HostOs::current(), std::env::consts::ARCH),
            cache_dir,
        )
    }

    /// Compare the newest release with `installed`.
    pub async fn check(&self, http: &reqwest::Client, installed: &str) -> ToolUpdate {
        let Some(pattern) = self.pattern else {
            debug!("No tool build for this host");
            return ToolUpdate::default();
        };

        let releases = match fetch_releases(http, &self.url).await {
            Ok(releases) => releases,
            Err(e) => {
                warn!(error = %e, "Tool release feed unavailable");
                return self.cached_offer(pattern, installed);
            }
        };

        let Some(release) = releases.first() else {
            return ToolUpdate::default();
        };
        let version = release.tag_name.trim_start_matches('v').to_string();
        if !is_newer(&version, installed) {
            debug!(latest = %version, installed, "Tool is up to date");
            return ToolUpdate {
                version: Some(version),
                ..ToolUpdate::default()
            };
        }

        let Some(asset) = release.assets.iter().find(|a| a.name.contains(pattern)) else {
            info!(version = %version, pattern, "No tool asset for this host");
            return ToolUpdate {
                version: Some(version),
                ..ToolUpdate::default()
            };
        };

        info!(version = %version, asset = %asset.name, "Tool update available");
        ToolUpdate {
            available: true,
            version: Some(version),
            filename: Some(asset.name.clone()),
            url: Some(asset.browser_download_url.clone()),
            size: asset.size,
            error: false,
        }
    }

    /// Newest release archive left in the download cache.
    fn cached_offer(&self, pattern: &str, installed: &str) -> ToolUpdate {
        let cached = cached_files(&self.cache_dir)
            .into_iter()
            .find(|f| f.key.contains(pattern));
        let Some(file) = cached else {
            return ToolUpdate {
                error: true,
                ..ToolUpdate::default()
            };
        };
        let Some(version) = version_in(&file.key) else {
            return ToolUpdate {
                error: true,
                ..ToolUpdate::default()
            };
        };

        info!(file = %file.key, version = %version, "Offering cached tool release");
        ToolUpdate {
            available: is_newer(&version, installed),
            version: Some(version),
            url: Some(format!("file://{}", file.path.display())),
            filename: Some(file.key),
            size: file.size,
            error: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::cached_path;
    use crate::state::testing::serve_http;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    #[test]
    fn test_is_newer() {
        assert!(is_newer("1.10.0", "1.9.3"));
        assert!(is_newer("v2.0", "1.99.99"));
        assert!(is_newer("1.0.1", "v1.0.0"));
        assert!(!is_newer("1.0.0", "1.0.0"));
        assert!(!is_newer("1.0", "1.0.0"));
        assert!(!is_newer("1.2.0-beta", "1.2.0"));
        assert!(is_newer("0.0.1", ""));
        assert!(!is_newer("", ""));
    }

    #[test]
    fn test_asset_pattern() {
        assert_eq!(asset_pattern(HostOs::Linux, "x86_64"), Some("linux-x64"));
        assert_eq!(asset_pattern(HostOs::Windows, "x86"), Some("win32-x86"));
        assert_eq!(asset_pattern(HostOs::MacOs, "aarch64"), Some("darwin"));
        assert_eq!(asset_pattern(HostOs::Linux, "riscv64"), None);
        assert_eq!(asset_pattern(HostOs::Other, "x86_64"), None);
    }

    async fn server() -> String {
        serve_http(Router::new().route(
            "/releases",
            get(|| async {
                Json(json!([
                    {"tag_name": "v3.0.0", "prerelease": true, "assets": []},
                    {"tag_name": "v2.1.0", "assets": [
                        {"name": "tool-v2.1.0-darwin-x64.zip", "browser_download_url": "http://x/d.zip", "size": 5},
                        {"name": "tool-v2.1.0-linux-x64.zip", "browser_download_url": "http://x/l.zip", "size": 7}
                    ]}
                ]))
            }),
        ))
        .await
    }

    #[tokio::test]
    async fn test_check_offers_matching_asset() {
        let base = server().await;
        let dir = tempfile::tempdir().unwrap();
        let http = reqwest::Client::new();

        let feed = ToolFeed::new(&format!("{base}/releases"), Some("linux-x64"), dir.path());
        let update = feed.check(&http, "2.0.0").await;
        assert!(update.available);
        assert_eq!(update.version.as_deref(), Some("2.1.0"));
        assert_eq!(update.filename.as_deref(), Some("tool-v2.1.0-linux-x64.zip"));
        assert_eq!(update.size, 7);

        assert!(!feed.check(&http, "2.1.0").await.available);

        let feed = ToolFeed::new(&format!("{base}/releases"), Some("win32-x86"), dir.path());
        let update = feed.check(&http, "1.0.0").await;
        assert!(!update.available);
        assert!(!update.error);
    }

    #[tokio::test]
    async fn test_network_failure_falls_back_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let http = reqwest::Client::new();
        let feed = ToolFeed::new("http://127.0.0.1:9/releases", Some("linux-x64"), dir.path());

        let update = feed.check(&http, "1.0.0").await;
        assert!(!update.available);
        assert!(update.error);

        let key = "tool-v1.5.2-linux-x64.zip";
        std::fs::write(cached_path(dir.path(), key), b"zip").unwrap();
        let update = feed.check(&http, "1.0.0").await;
        assert!(update.available);
        assert!(!update.error);
        assert_eq!(update.version.as_deref(), Some("1.5.2"));
        assert_eq!(update.filename.as_deref(), Some(key));
        assert!(update.url.unwrap().starts_with("file://"));
    }
}
