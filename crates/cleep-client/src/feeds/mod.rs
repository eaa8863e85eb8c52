//! Release feeds: the installable image catalog and the flashing tool
//! releases.
//!
//! Both feeds tolerate a network outage. They log and return an empty
//! catalog or "no update" rather than failing the caller.

pub mod images;
pub mod releases;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::error;

pub use images::{FeedUrls, ImageCatalog};
pub use releases::{asset_pattern, is_newer, ToolFeed};

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {status} for {url}")]
    Http { url: String, status: u16 },

    #[error("Invalid feed content: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, FeedError>;

/// Release as returned by the GitHub releases API.
#[derive(Debug, Clone, Deserialize)]
pub struct GithubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<GithubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

impl GithubRelease {
    pub fn asset_ending_with(&self, suffix: &str) -> Option<&GithubAsset> {
        self.assets.iter().find(|a| a.name.ends_with(suffix))
    }
}

async fn get(http: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    let response = http
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json, text/html, */*")
        .send()
        .await
        .map_err(|e| FeedError::Network(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        error!(url, status = status.as_u16(), "Feed request failed");
        return Err(FeedError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

pub(crate) async fn fetch_text(http: &reqwest::Client, url: &str) -> Result<String> {
    get(http, url)
        .await?
        .text()
        .await
        .map_err(|e| FeedError::Network(e.to_string()))
}

/// Published releases, newest first, drafts and pre-releases excluded.
pub(crate) async fn fetch_releases(http: &reqwest::Client, url: &str) -> Result<Vec<GithubRelease>> {
    let releases: Vec<GithubRelease> = get(http, url)
        .await?
        .json()
        .await
        .map_err(|e| FeedError::Parse(e.to_string()))?;
    Ok(releases
        .into_iter()
        .filter(|r| !r.draft && !r.prerelease)
        .collect())
}

/// First whitespace separated token of a checksum file.
pub(crate) fn first_token(content: &str) -> Option<String> {
    content
        .split_whitespace()
        .next()
        .filter(|t| t.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_token() {
        assert_eq!(
            first_token("ABCDEF0123  2023-05-03-raspios-bullseye-armhf.zip\n").as_deref(),
            Some("abcdef0123")
        );
        assert_eq!(first_token("   \n"), None);
        assert_eq!(first_token("<html>"), None);
    }

    #[test]
    fn test_release_deserialize() {
        let release: GithubRelease = serde_json::from_str(
            r#"{"tag_name": "v1.2.0", "published_at": "2023-05-03T10:00:00Z",
                "assets": [{"name": "a.zip", "browser_download_url": "http://x/a.zip", "size": 3}]}"#,
        )
        .unwrap();
        assert!(!release.draft);
        assert_eq!(release.asset_ending_with(".zip").unwrap().size, 3);
        assert!(release.asset_ending_with(".sha256").is_none());
    }
}
