//! Download engine.
//!
//! Streams an HTTP body into the private cache directory while hashing it,
//! then checks the declared size and the expected checksum. Files follow
//! three naming schemes:
//!
//! - `cleep_tmp_<uuid>`: transfer in progress
//! - `cleep_download_<uuid>`: completed, discarded at job end or next start
//! - `cleep_cached_<base64url(key)>`: completed under a cache key, reused
//!
//! Failures are reported twice: as a terminal status on the progress
//! callback, and as the returned [`DownloadError`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use md5::Md5;
use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use cleep_shared::constants::{CACHED_PREFIX, DOWNLOAD_PREFIX, TMP_PREFIX};
use cleep_shared::types::DownloadStatus;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Download canceled")]
    Canceled,

    #[error("Invalid size: expected {expected} bytes, got {written}")]
    InvalidSize { expected: u64, written: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    BadChecksum { expected: String, actual: String },

    #[error("Unsupported checksum: {0}")]
    InvalidChecksum(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {0}")]
    Http(u16),

    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DownloadError {
    /// Terminal status reported on the progress callback.
    pub fn status(&self) -> DownloadStatus {
        match self {
            Self::Canceled => DownloadStatus::Canceled,
            Self::InvalidSize { .. } => DownloadStatus::ErrorInvalidSize,
            Self::BadChecksum { .. } => DownloadStatus::ErrorBadChecksum,
            Self::Network(_) => DownloadStatus::ErrorNetwork,
            Self::InvalidChecksum(_) | Self::Http(_) | Self::InvalidUrl(_) | Self::Io(_) => {
                DownloadStatus::Error
            }
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::Http(status.as_u16()),
            None => Self::Network(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// Expected digest, algorithm picked from the hex length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Sha1(String),
    Sha256(String),
    Md5(String),
}

impl Checksum {
    pub fn parse(value: &str) -> Result<Self> {
        let hex = value.trim().to_ascii_lowercase();
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DownloadError::InvalidChecksum(value.to_string()));
        }
        match hex.len() {
            40 => Ok(Self::Sha1(hex)),
            64 => Ok(Self::Sha256(hex)),
            32 => Ok(Self::Md5(hex)),
            _ => Err(DownloadError::InvalidChecksum(value.to_string())),
        }
    }

    fn expected(&self) -> &str {
        match self {
            Self::Sha1(h) | Self::Sha256(h) | Self::Md5(h) => h,
        }
    }

    fn hasher(&self) -> Hasher {
        match self {
            Self::Sha1(_) => Hasher::Sha1(Sha1::new()),
            Self::Sha256(_) => Hasher::Sha256(Sha256::new()),
            Self::Md5(_) => Hasher::Md5(Md5::new()),
        }
    }
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Md5(Md5),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Md5(h) => h.update(data),
        }
    }

    fn finalize(self) -> String {
        match self {
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Md5(h) => hex::encode(h.finalize()),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub status: DownloadStatus,
    pub downloaded: u64,
    pub total: Option<u64>,
    /// 0-100, or -1 while the size is unknown.
    pub percent: i32,
}

impl DownloadProgress {
    fn done(size: u64) -> Self {
        Self {
            status: DownloadStatus::Done,
            downloaded: size,
            total: Some(size),
            percent: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache layout
// ---------------------------------------------------------------------------

/// Deterministic location of the file cached under `key`.
pub fn cached_path(cache_dir: &Path, key: &str) -> PathBuf {
    cache_dir.join(format!("{CACHED_PREFIX}{}", URL_SAFE_NO_PAD.encode(key)))
}

/// A file kept in the cache under its key.
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Cached files, most recent first.
pub fn cached_files(cache_dir: &Path) -> Vec<CachedFile> {
    let Ok(entries) = fs::read_dir(cache_dir) else {
        return Vec::new();
    };

    let mut files: Vec<CachedFile> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let encoded = name.strip_prefix(CACHED_PREFIX)?;
            let key = URL_SAFE_NO_PAD.decode(encoded).ok()?;
            let key = String::from_utf8(key).ok()?;
            let meta = entry.metadata().ok()?;
            Some(CachedFile {
                key,
                path: entry.path(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })
        })
        .collect();
    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    files
}

/// Sweep the cache directory. Temporary and non-cached downloads always go,
/// cached files only when `force_all` is set.
pub fn purge(cache_dir: &Path, force_all: bool) -> io::Result<usize> {
    let entries = match fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        let sweep = name.starts_with(TMP_PREFIX)
            || name.starts_with(DOWNLOAD_PREFIX)
            || (force_all && name.starts_with(CACHED_PREFIX));
        if !sweep {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(file = %name, error = %e, "Failed to purge cache file"),
        }
    }
    info!(removed, force_all, "Download cache purged");
    Ok(removed)
}

/// Local path of a `file://` url.
fn local_path(url: &str) -> Option<PathBuf> {
    let path = url.strip_prefix("file://")?;
    if cfg!(windows) {
        let bytes = path.as_bytes();
        if bytes.len() > 2 && bytes[0] == b'/' && bytes[2] == b':' {
            return Some(PathBuf::from(&path[1..]));
        }
    }
    Some(PathBuf::from(path))
}

// ---------------------------------------------------------------------------
// Downloader
// ---------------------------------------------------------------------------

/// One download job. Cancellation is checked between chunks.
pub struct Downloader {
    http: reqwest::Client,
    cache_dir: PathBuf,
    cancel: Arc<AtomicBool>,
    /// Non-cached files written by this job.
    created: Vec<PathBuf>,
}

impl Downloader {
    pub fn new(http: reqwest::Client, cache_dir: &Path) -> Self {
        Self::with_cancel(http, cache_dir, Arc::new(AtomicBool::new(false)))
    }

    /// Share an externally owned cancel flag.
    pub fn with_cancel(http: reqwest::Client, cache_dir: &Path, cancel: Arc<AtomicBool>) -> Self {
        Self {
            http,
            cache_dir: cache_dir.to_path_buf(),
            cancel,
            created: Vec::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Fetch `url` and return the local file path.
    ///
    /// `file://` urls and cache hits complete immediately with a single
    /// `done` event.
    pub async fn download<F>(
        &mut self,
        url: &str,
        checksum: Option<&str>,
        cache_key: Option<&str>,
        mut progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let mut last = DownloadProgress {
            status: DownloadStatus::Idle,
            downloaded: 0,
            total: None,
            percent: 0,
        };

        let result = {
            let mut emit = |p: DownloadProgress| {
                last = p.clone();
                progress(p);
            };
            self.fetch(url, checksum, cache_key, &mut emit).await
        };

        if let Err(e) = &result {
            warn!(url, error = %e, "Download failed");
            progress(DownloadProgress {
                status: e.status(),
                percent: last.percent.max(0),
                ..last
            });
        }
        result
    }

    async fn fetch(
        &mut self,
        url: &str,
        checksum: Option<&str>,
        cache_key: Option<&str>,
        emit: &mut (dyn FnMut(DownloadProgress) + Send),
    ) -> Result<PathBuf> {
        let checksum = checksum
            .filter(|c| !c.trim().is_empty())
            .map(Checksum::parse)
            .transpose()?;

        if let Some(path) = local_path(url) {
            let size = tokio::fs::metadata(&path).await?.len();
            debug!(path = %path.display(), "Using local image");
            emit(DownloadProgress::done(size));
            return Ok(path);
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(DownloadError::InvalidUrl(url.to_string()));
        }

        if let Some(key) = cache_key {
            let path = cached_path(&self.cache_dir, key);
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                info!(key, "Download served from cache");
                emit(DownloadProgress::done(meta.len()));
                return Ok(path);
            }
        }

        if self.is_canceled() {
            return Err(DownloadError::Canceled);
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let mut response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::error!(url, status = status.as_u16(), "Download request rejected");
            return Err(DownloadError::Http(status.as_u16()));
        }

        let total = response.content_length();
        let mut current = DownloadProgress {
            status: if total.is_some() {
                DownloadStatus::Downloading
            } else {
                DownloadStatus::DownloadingNosize
            },
            downloaded: 0,
            total,
            percent: if total.is_some() { 0 } else { -1 },
        };
        emit(current.clone());

        let tmp_path = self
            .cache_dir
            .join(format!("{TMP_PREFIX}{}", uuid::Uuid::new_v4()));
        self.created.push(tmp_path.clone());
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut hasher = checksum.as_ref().map(Checksum::hasher);

        info!(url, size = ?total, "Download started");
        loop {
            if self.is_canceled() {
                info!(url, downloaded = current.downloaded, "Download canceled");
                return Err(DownloadError::Canceled);
            }
            let Some(chunk) = response.chunk().await? else {
                break;
            };
            file.write_all(&chunk).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }

            current.downloaded += chunk.len() as u64;
            if let Some(total) = total.filter(|t| *t > 0) {
                current.percent = (current.downloaded.saturating_mul(100) / total).min(100) as i32;
            }
            emit(current.clone());
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = total {
            if expected != current.downloaded {
                return Err(DownloadError::InvalidSize {
                    expected,
                    written: current.downloaded,
                });
            }
        }

        if let (Some(checksum), Some(hasher)) = (checksum.as_ref(), hasher) {
            let actual = hasher.finalize();
            if actual != checksum.expected() {
                return Err(DownloadError::BadChecksum {
                    expected: checksum.expected().to_string(),
                    actual,
                });
            }
            debug!(url, "Checksum verified");
        }

        let final_path = match cache_key {
            Some(key) => cached_path(&self.cache_dir, key),
            None => self
                .cache_dir
                .join(format!("{DOWNLOAD_PREFIX}{}", uuid::Uuid::new_v4())),
        };
        tokio::fs::rename(&tmp_path, &final_path).await?;
        self.created.retain(|p| p != &tmp_path);
        if cache_key.is_none() {
            self.created.push(final_path.clone());
        }

        info!(url, bytes = current.downloaded, path = %final_path.display(), "Download done");
        emit(DownloadProgress::done(current.downloaded));
        Ok(final_path)
    }

    /// Remove the non-cached files this job wrote.
    pub fn discard_own(&mut self) {
        for path in self.created.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Download removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove download"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::serve_http;
    use axum::body::{Body, Bytes};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    const CONTENT: &[u8] = b"cleep image content";

    fn sha256_of(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    async fn server() -> String {
        let router = Router::new()
            .route("/image.img", get(|| async { CONTENT }))
            .route(
                "/stream.img",
                get(|| async {
                    let chunks = vec![
                        Ok::<_, io::Error>(Bytes::from_static(b"part one ")),
                        Ok(Bytes::from_static(b"part two")),
                    ];
                    Body::from_stream(futures::stream::iter(chunks))
                }),
            )
            .route("/missing.img", get(|| async { StatusCode::NOT_FOUND }));
        serve_http(router).await
    }

    fn downloader(dir: &Path) -> Downloader {
        Downloader::new(reqwest::Client::new(), dir)
    }

    #[test]
    fn test_checksum_detection() {
        assert!(matches!(Checksum::parse(&"a".repeat(40)), Ok(Checksum::Sha1(_))));
        assert!(matches!(Checksum::parse(&"B".repeat(64)), Ok(Checksum::Sha256(h)) if h == "b".repeat(64)));
        assert!(matches!(Checksum::parse(&"0".repeat(32)), Ok(Checksum::Md5(_))));
        assert!(Checksum::parse("1234").is_err());
        assert!(Checksum::parse(&"z".repeat(40)).is_err());
    }

    #[tokio::test]
    async fn test_download_with_checksum() {
        let base = server().await;
        let dir = tempfile::tempdir().unwrap();
        let mut dl = downloader(dir.path());
        let mut events = Vec::new();

        let path = dl
            .download(
                &format!("{base}/image.img"),
                Some(&sha256_of(CONTENT)),
                None,
                |p| events.push(p),
            )
            .await
            .unwrap();

        assert_eq!(fs::read(&path).unwrap(), CONTENT);
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(DOWNLOAD_PREFIX));
        assert_eq!(events.first().unwrap().status, DownloadStatus::Downloading);
        let last = events.last().unwrap();
        assert_eq!(last.status, DownloadStatus::Done);
        assert_eq!(last.downloaded, CONTENT.len() as u64);
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));

        dl.discard_own();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bad_checksum() {
        let base = server().await;
        let dir = tempfile::tempdir().unwrap();
        let mut dl = downloader(dir.path());
        let mut statuses = Vec::new();

        let err = dl
            .download(
                &format!("{base}/image.img"),
                Some(&"0".repeat(64)),
                None,
                |p| statuses.push(p.status),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::BadChecksum { .. }));
        assert_eq!(statuses.last(), Some(&DownloadStatus::ErrorBadChecksum));

        dl.discard_own();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_size_never_reports_partial_percent() {
        let base = server().await;
        let dir = tempfile::tempdir().unwrap();
        let mut events = Vec::new();

        let path = downloader(dir.path())
            .download(&format!("{base}/stream.img"), None, None, |p| events.push(p))
            .await
            .unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"part one part two");
        assert_eq!(events[0].status, DownloadStatus::DownloadingNosize);
        assert!(events
            .iter()
            .all(|p| p.percent == -1 || p.percent == 100 || p.percent == 0));
        assert_eq!(events.last().unwrap().status, DownloadStatus::Done);
    }

    #[tokio::test]
    async fn test_cache_key_short_circuits() {
        let base = server().await;
        let dir = tempfile::tempdir().unwrap();

        let first = downloader(dir.path())
            .download(&format!("{base}/image.img"), None, Some("flash.iso"), |_| {})
            .await
            .unwrap();
        assert_eq!(first, cached_path(dir.path(), "flash.iso"));

        // The url is unreachable now, the cached copy must be served.
        let mut events = Vec::new();
        let mut dl = downloader(dir.path());
        let second = dl
            .download(&format!("{base}/missing.img"), None, Some("flash.iso"), |p| {
                events.push(p)
            })
            .await
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, DownloadStatus::Done);
        assert_eq!(events[0].percent, 100);

        dl.discard_own();
        assert!(first.exists());
        let cached = cached_files(dir.path());
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].key, "flash.iso");
    }

    #[tokio::test]
    async fn test_local_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("local.img");
        fs::write(&image, b"local").unwrap();
        let mut events = Vec::new();

        let path = downloader(dir.path())
            .download(&format!("file://{}", image.display()), None, None, |p| {
                events.push(p)
            })
            .await
            .unwrap();
        assert_eq!(path, image);
        assert_eq!(events, vec![DownloadProgress::done(5)]);
    }

    #[tokio::test]
    async fn test_http_error_and_cancel() {
        let base = server().await;
        let dir = tempfile::tempdir().unwrap();
        let mut statuses = Vec::new();

        let err = downloader(dir.path())
            .download(&format!("{base}/missing.img"), None, None, |p| statuses.push(p.status))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Http(404)));
        assert_eq!(statuses, vec![DownloadStatus::Error]);

        let mut dl = downloader(dir.path());
        dl.cancel();
        let err = dl
            .download(&format!("{base}/image.img"), None, None, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.status(), DownloadStatus::Canceled);
    }

    #[test]
    fn test_purge() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "cleep_tmp_1",
            "cleep_download_2",
            "cleep_cached_Zm9v",
            "unrelated.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        assert_eq!(purge(dir.path(), false).unwrap(), 2);
        assert!(dir.path().join("cleep_cached_Zm9v").exists());
        assert_eq!(purge(dir.path(), true).unwrap(), 1);
        assert!(dir.path().join("unrelated.txt").exists());
        assert_eq!(purge(&dir.path().join("nope"), true).unwrap(), 0);
    }
}
