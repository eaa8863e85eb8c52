//! Installable image catalog.
//!
//! Official Cleep images come from the Cleep release API (a zip asset plus
//! its sha256 file). Upstream Raspberry Pi OS images, full and lite, come
//! from directory listings: the newest dated folder holds the archive and
//! its checksum siblings.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use cleep_shared::constants::{
    CLEEP_RELEASES_URL, IMAGES_CACHE_TTL_SECS, RASPIOS_INDEX_URL, RASPIOS_LITE_INDEX_URL,
};
use cleep_shared::types::{ImageCategory, ImageEntry};

use super::{fetch_releases, fetch_text, first_token, Result};

static HREF: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r#"href="([^"]+)""#).ok());
static DATED_FOLDER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(\d{4}-\d{2}-\d{2})/?$").ok());

/// Feed locations.
#[derive(Debug, Clone)]
pub struct FeedUrls {
    pub cleep_releases: String,
    pub raspios: String,
    pub raspios_lite: String,
}

impl Default for FeedUrls {
    fn default() -> Self {
        Self {
            cleep_releases: CLEEP_RELEASES_URL.to_string(),
            raspios: RASPIOS_INDEX_URL.to_string(),
            raspios_lite: RASPIOS_LITE_INDEX_URL.to_string(),
        }
    }
}

struct CachedCatalog {
    at: Instant,
    upstream: bool,
    images: Vec<ImageEntry>,
}

pub struct ImageCatalog {
    urls: FeedUrls,
    ttl: Duration,
    cache: Mutex<Option<CachedCatalog>>,
}

impl ImageCatalog {
    pub fn new(urls: FeedUrls) -> Self {
        Self {
            urls,
            ttl: Duration::from_secs(IMAGES_CACHE_TTL_SECS),
            cache: Mutex::new(None),
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    fn cached(&self, upstream: bool) -> Option<Vec<ImageEntry>> {
        let cache = self.cache.lock().ok()?;
        cache
            .as_ref()
            .filter(|c| c.upstream == upstream && c.at.elapsed() < self.ttl)
            .map(|c| c.images.clone())
    }

    /// Images offered to the user, newest first within each category.
    ///
    /// `upstream` adds the Raspberry Pi OS flavours. The result is cached
    /// until the TTL expires, `force` is set or the flag changes.
    pub async fn images(&self, http: &reqwest::Client, upstream: bool, force: bool) -> Vec<ImageEntry> {
        if !force {
            if let Some(images) = self.cached(upstream) {
                return images;
            }
        }

        let mut images = match self.official(http).await {
            Ok(images) => images,
            Err(e) => {
                warn!(error = %e, "Official image feed unavailable");
                Vec::new()
            }
        };

        if upstream {
            for (url, label) in [
                (&self.urls.raspios, "Raspberry Pi OS"),
                (&self.urls.raspios_lite, "Raspberry Pi OS Lite"),
            ] {
                match upstream_latest(http, url, label).await {
                    Ok(Some(entry)) => images.push(entry),
                    Ok(None) => debug!(url = %url, "No upstream image found"),
                    Err(e) => warn!(url = %url, error = %e, "Upstream image feed unavailable"),
                }
            }
        }

        info!(count = images.len(), upstream, "Image catalog refreshed");
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(CachedCatalog {
                at: Instant::now(),
                upstream,
                images: images.clone(),
            });
        }
        images
    }

    async fn official(&self, http: &reqwest::Client) -> Result<Vec<ImageEntry>> {
        let releases = fetch_releases(http, &self.urls.cleep_releases).await?;
        let Some((release, archive)) = releases
            .iter()
            .find_map(|r| r.asset_ending_with(".zip").map(|a| (r, a)))
        else {
            return Ok(Vec::new());
        };

        let sha256 = match release.asset_ending_with(".sha256") {
            Some(asset) => checksum(http, &asset.browser_download_url).await,
            None => None,
        };
        let version = release.tag_name.trim_start_matches('v');

        Ok(vec![ImageEntry {
            label: format!("Cleep v{version}"),
            url: archive.browser_download_url.clone(),
            timestamp: release.published_at.map(|d| d.timestamp()).unwrap_or(0),
            category: ImageCategory::Official,
            sha256,
            sha1: None,
        }])
    }
}

impl Default for ImageCatalog {
    fn default() -> Self {
        Self::new(FeedUrls::default())
    }
}

async fn checksum(http: &reqwest::Client, url: &str) -> Option<String> {
    match fetch_text(http, url).await {
        Ok(content) => first_token(&content),
        Err(e) => {
            warn!(url, error = %e, "Checksum file unavailable");
            None
        }
    }
}

fn hrefs(page: &str) -> Vec<String> {
    let Some(re) = HREF.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(page)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn join_url(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), href.trim_start_matches('/'))
    }
}

/// Newest dated folder of an index page, with its date.
fn latest_folder(page: &str) -> Option<(String, NaiveDate)> {
    let re = DATED_FOLDER.as_ref()?;
    hrefs(page)
        .into_iter()
        .filter_map(|href| {
            let date = re.captures(&href)?.get(1)?.as_str().to_string();
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").ok()?;
            Some((href, date))
        })
        .max_by_key(|(_, date)| *date)
}

/// Image archive and checksum siblings listed in a release folder.
#[derive(Debug, Default, PartialEq, Eq)]
struct FolderListing {
    archive: Option<String>,
    sha1: Option<String>,
    sha256: Option<String>,
}

fn parse_folder(page: &str) -> FolderListing {
    let mut listing = FolderListing::default();
    for href in hrefs(page) {
        if href.ends_with(".zip") || href.ends_with(".img.xz") {
            listing.archive.get_or_insert(href);
        } else if href.ends_with(".sha1") {
            listing.sha1.get_or_insert(href);
        } else if href.ends_with(".sha256") {
            listing.sha256.get_or_insert(href);
        }
    }
    listing
}

async fn upstream_latest(
    http: &reqwest::Client,
    index_url: &str,
    label: &str,
) -> Result<Option<ImageEntry>> {
    let index = fetch_text(http, index_url).await?;
    let Some((folder, date)) = latest_folder(&index) else {
        return Ok(None);
    };
    let folder_url = join_url(index_url, &folder);
    let listing = parse_folder(&fetch_text(http, &folder_url).await?);
    let Some(archive) = listing.archive else {
        return Ok(None);
    };

    let sha1 = match listing.sha1 {
        Some(href) => checksum(http, &join_url(&folder_url, &href)).await,
        None => None,
    };
    let sha256 = match listing.sha256 {
        Some(href) => checksum(http, &join_url(&folder_url, &href)).await,
        None => None,
    };

    Ok(Some(ImageEntry {
        label: format!("{label} {date}"),
        url: join_url(&folder_url, &archive),
        timestamp: date
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc().timestamp())
            .unwrap_or(0),
        category: ImageCategory::Upstream,
        sha256,
        sha1,
    }))
}
