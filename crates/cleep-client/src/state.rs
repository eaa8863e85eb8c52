//! Application context threaded into every worker.
//!
//! The [`AppContext`] is shared behind an `Arc`. It owns the configuration
//! store, the crash sink, the UI push channel, the filesystem layout and the
//! HTTP client used by the download engine and the release feeds.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use cleep_shared::constants::{DEFAULT_BUS_PORT, USER_AGENT, WIFI_FILE_PREFIX};
use cleep_store::{ConfigStore, ProxySection};

use crate::crash::CrashReporter;
use crate::events::UiPush;

// ---------------------------------------------------------------------------
// Runtime options
// ---------------------------------------------------------------------------

/// Settings taken from the command line and the environment.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Configuration file path.
    /// Env: `CLEEP_CONFIG`
    pub config_path: Option<PathBuf>,

    /// Force debug logging regardless of the configuration.
    /// Env: `CLEEP_DEBUG` (true/false)
    pub debug: bool,

    /// Download cache directory.
    /// Env: `CLEEP_CACHE_DIR`
    /// Default: `<temp>/cleepdesktop`
    pub cache_dir: Option<PathBuf>,

    /// Flasher binary, bypassing the one found in the tool install dir.
    /// Env: `CLEEP_FLASHER`
    pub flasher: Option<PathBuf>,

    /// Peer bus listen port.
    /// Env: `CLEEP_BUS_PORT`
    pub bus_port: Option<u16>,

    /// Run without the peer bus (no discovery, no device commands).
    /// Env: `CLEEP_OFFLINE` (true/false)
    pub offline: bool,
}

impl RuntimeOptions {
    /// Load options from environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(path) = std::env::var("CLEEP_CONFIG") {
            if !path.is_empty() {
                options.config_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(val) = std::env::var("CLEEP_DEBUG") {
            options.debug = val != "false" && val != "0";
        }

        if let Ok(path) = std::env::var("CLEEP_CACHE_DIR") {
            if !path.is_empty() {
                options.cache_dir = Some(PathBuf::from(path));
            }
        }

        if let Ok(path) = std::env::var("CLEEP_FLASHER") {
            if !path.is_empty() {
                options.flasher = Some(PathBuf::from(path));
            }
        }

        if let Ok(val) = std::env::var("CLEEP_OFFLINE") {
            options.offline = val != "false" && val != "0";
        }

        if let Ok(val) = std::env::var("CLEEP_BUS_PORT") {
            match val.parse::<u16>() {
                Ok(port) => options.bus_port = Some(port),
                Err(_) => tracing::warn!(value = %val, "Invalid CLEEP_BUS_PORT, using default"),
            }
        }

        options
    }

    /// First command line argument, when given, wins over `CLEEP_CONFIG`.
    pub fn with_args(mut self, mut args: impl Iterator<Item = String>) -> Self {
        if let Some(path) = args.next().filter(|a| !a.is_empty()) {
            self.config_path = Some(PathBuf::from(path));
        }
        self
    }

    pub fn bus_port(&self) -> u16 {
        self.bus_port.unwrap_or(DEFAULT_BUS_PORT)
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory holding the configuration file, handed to the flasher.
    pub config_dir: PathBuf,
    /// Download cache, also home of temporary Wi-Fi credential files.
    pub cache_dir: PathBuf,
}

impl AppPaths {
    pub fn new(config_path: &Path, options: &RuntimeOptions) -> Self {
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let cache_dir = options
            .cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("cleepdesktop"));
        Self {
            config_dir,
            cache_dir,
        }
    }

    /// Fresh path for a Wi-Fi credential file.
    pub fn wifi_file(&self) -> PathBuf {
        self.cache_dir
            .join(format!("{WIFI_FILE_PREFIX}{}.json", uuid::Uuid::new_v4()))
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct AppContext {
    pub config: Arc<ConfigStore>,
    pub crash: Arc<dyn CrashReporter>,
    pub ui: UiPush,
    pub paths: AppPaths,
    pub options: RuntimeOptions,
    http: RwLock<reqwest::Client>,
}

impl AppContext {
    pub fn new(
        config: Arc<ConfigStore>,
        crash: Arc<dyn CrashReporter>,
        ui: UiPush,
        paths: AppPaths,
        options: RuntimeOptions,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&paths.cache_dir)?;
        let proxy = config.read(|c| c.proxy.clone())?;
        let http = build_http_client(&proxy)?;

        Ok(Self {
            config,
            crash,
            ui,
            paths,
            options,
            http: RwLock::new(http),
        })
    }

    /// Shared HTTP client (cheap clone).
    pub fn http(&self) -> reqwest::Client {
        match self.http.read() {
            Ok(client) => client.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Rebuild the HTTP client after a proxy change.
    pub fn apply_proxy(&self, proxy: &ProxySection) -> reqwest::Result<()> {
        let client = build_http_client(proxy)?;
        match self.http.write() {
            Ok(mut guard) => *guard = client,
            Err(poisoned) => *poisoned.into_inner() = client,
        }
        tracing::info!(proxy = ?proxy.url(), "HTTP client rebuilt");
        Ok(())
    }

    /// Forward an unexpected failure to the crash sink.
    pub fn report(&self, context: &str, error: &dyn std::fmt::Display) {
        self.crash.report(context, &error.to_string());
    }
}

pub fn build_http_client(proxy: &ProxySection) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(10));

    builder = match proxy.url() {
        Some(url) => builder.proxy(reqwest::Proxy::all(url)?),
        None => builder.no_proxy(),
    };

    builder.build()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::crash::TracingCrashReporter;

    /// Serve `router` on an ephemeral loopback port, returns its base URL.
    pub async fn serve_http(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Context backed by a temporary directory.
    pub fn context(dir: &Path) -> Arc<AppContext> {
        context_with(dir, RuntimeOptions::default())
    }

    pub fn context_with(dir: &Path, mut options: RuntimeOptions) -> Arc<AppContext> {
        let config_path = dir.join("config").join("cleepdesktop.json");
        let config = Arc::new(ConfigStore::open(&config_path).unwrap());
        if options.cache_dir.is_none() {
            options.cache_dir = Some(dir.join("cache"));
        }
        let paths = AppPaths::new(&config_path, &options);
        Arc::new(
            AppContext::new(
                config,
                Arc::new(TracingCrashReporter::new(false)),
                UiPush::new(),
                paths,
                options,
            )
            .unwrap(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config_path() {
        let options = RuntimeOptions::default()
            .with_args(vec!["/tmp/custom.json".to_string()].into_iter());
        assert_eq!(options.config_path, Some(PathBuf::from("/tmp/custom.json")));
        assert_eq!(options.bus_port(), DEFAULT_BUS_PORT);
    }

    #[test]
    fn test_paths_layout() {
        let options = RuntimeOptions {
            cache_dir: Some(PathBuf::from("/var/cache/cleep")),
            ..RuntimeOptions::default()
        };
        let paths = AppPaths::new(Path::new("/etc/cleep/conf.json"), &options);
        assert_eq!(paths.config_dir, PathBuf::from("/etc/cleep"));
        assert!(paths
            .wifi_file()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(WIFI_FILE_PREFIX));
    }

    #[test]
    fn test_context_applies_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = testing::context(dir.path());
        assert!(dir.path().join("cache").is_dir());

        let proxy = ProxySection {
            mode: cleep_store::ProxyMode::Manualproxy,
            host: "127.0.0.1".into(),
            port: 3128,
        };
        ctx.apply_proxy(&proxy).unwrap();
    }
}
