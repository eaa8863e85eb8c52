//! Configuration document and its file-backed store.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use cleep_shared::types::Peer;

use crate::error::{Result, StoreError};

/// Sections the UI is allowed to replace with `set_config`.
pub const EDITABLE_SECTIONS: [&str; 3] = ["cleep", "etcher", "proxy"];

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Application section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleepSection {
    /// Version of the application that last wrote the file.
    pub version: String,
    pub debug: bool,
    pub isdev: bool,
    pub crashreport: bool,
    /// Offer upstream Raspberry Pi OS images next to official ones.
    pub isoraspios: bool,
    /// Allow installing local image files (`file://`).
    pub isolocal: bool,
    pub locale: String,
    /// Wall-clock time ("HH:MM") of the daily tool update check.
    pub autoupdate_time: String,
    /// Run the flasher through the platform privilege helper.
    pub elevate: bool,
    /// Identity of this desktop instance on the peer bus.
    pub uuid: String,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Default for CleepSection {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            debug: false,
            isdev: false,
            crashreport: true,
            isoraspios: false,
            isolocal: false,
            locale: "en".to_string(),
            autoupdate_time: "12:00".to_string(),
            elevate: true,
            uuid: String::new(),
            other: Map::new(),
        }
    }
}

/// Flashing tool section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolSection {
    /// Installed tool version ("" when never installed).
    pub version: String,
    pub install_dir: Option<PathBuf>,
    pub installer: Option<PathBuf>,
    pub flasher: Option<PathBuf>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    Noproxy,
    Manualproxy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxySection {
    pub mode: ProxyMode,
    pub host: String,
    pub port: u16,
}

impl ProxySection {
    /// Proxy URL when a manual proxy is configured.
    pub fn url(&self) -> Option<String> {
        match self.mode {
            ProxyMode::Manualproxy if !self.host.is_empty() => {
                let host = self.host.trim_end_matches('/');
                if host.contains("://") {
                    Some(format!("{host}:{}", self.port))
                } else {
                    Some(format!("http://{host}:{}", self.port))
                }
            }
            _ => None,
        }
    }
}

/// Whole configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub cleep: CleepSection,
    pub etcher: ToolSection,
    pub proxy: ProxySection,
    /// Known devices keyed by uuid.
    pub devices: BTreeMap<String, Peer>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// File-backed configuration guarded by a single mutex.
pub struct ConfigStore {
    path: PathBuf,
    config: Mutex<AppConfig>,
}

impl ConfigStore {
    /// Platform default location of the configuration file:
    /// - Linux:   `~/.config/cleepdesktop/cleepdesktop.json`
    /// - macOS:   `~/Library/Application Support/com.cleep.cleepdesktop/cleepdesktop.json`
    /// - Windows: `{FOLDERID_RoamingAppData}\cleep\cleepdesktop\config\cleepdesktop.json`
    pub fn default_path() -> Result<PathBuf> {
        let dirs =
            ProjectDirs::from("com", "cleep", "cleepdesktop").ok_or(StoreError::NoConfigDir)?;
        Ok(dirs.config_dir().join("cleepdesktop.json"))
    }

    /// Open (or create) the configuration file at `path`.
    ///
    /// Missing keys are filled with defaults and the completed document is
    /// written back so the file always reflects the full schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut config = match fs::read_to_string(path) {
            Ok(content) if !content.trim().is_empty() => serde_json::from_str(&content)?,
            Ok(_) => AppConfig::default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Creating default configuration");
                AppConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        if config.cleep.uuid.is_empty() {
            config.cleep.uuid = uuid::Uuid::new_v4().to_string();
        }
        config.cleep.version = env!("CARGO_PKG_VERSION").to_string();

        write_atomic(path, &config)?;
        info!(path = %path.display(), devices = config.devices.len(), "Configuration loaded");

        Ok(Self {
            path: path.to_path_buf(),
            config: Mutex::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, AppConfig>> {
        self.config.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Snapshot copy of the whole document.
    pub fn get(&self) -> Result<AppConfig> {
        Ok(self.lock()?.clone())
    }

    /// Run `f` against the current document without copying it.
    pub fn read<R>(&self, f: impl FnOnce(&AppConfig) -> R) -> Result<R> {
        let guard = self.lock()?;
        Ok(f(&guard))
    }

    /// Apply `f` to a copy of the document and persist it.
    ///
    /// The in-memory document only changes once the file has been
    /// rewritten, so a failed write leaves both untouched.
    pub fn update<R>(&self, f: impl FnOnce(&mut AppConfig) -> R) -> Result<R> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        let out = f(&mut next);
        write_atomic(&self.path, &next)?;
        *guard = next;
        Ok(out)
    }

    /// Replace one editable section with a JSON value.
    pub fn set_section(&self, name: &str, value: Value) -> Result<AppConfig> {
        if !EDITABLE_SECTIONS.contains(&name) {
            return Err(StoreError::UnknownSection(name.to_string()));
        }

        let mut guard = self.lock()?;
        let mut doc = serde_json::to_value(&*guard)?;
        if let Value::Object(ref mut map) = doc {
            map.insert(name.to_string(), value);
        }
        let next: AppConfig = serde_json::from_value(doc)?;
        write_atomic(&self.path, &next)?;
        *guard = next.clone();

        debug!(section = %name, "Configuration section replaced");
        Ok(next)
    }
}

/// Write the document next to its destination, then rename over it.
fn write_atomic(path: &Path, config: &AppConfig) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config.json".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let json = serde_json::to_vec_pretty(config)?;
    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to write configuration");
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");

        let store = ConfigStore::open(&path).unwrap();
        assert!(path.exists());

        let config = store.get().unwrap();
        assert!(!config.cleep.uuid.is_empty());
        assert_eq!(config.cleep.autoupdate_time, "12:00");
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_missing_keys_filled_and_unknown_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"cleep": {"debug": true, "custom": 1}, "etcher": {"version": "v1.0.0"}, "legacy": {"a": 2}}"#,
        )
        .unwrap();

        let store = ConfigStore::open(&path).unwrap();
        let config = store.get().unwrap();
        assert!(config.cleep.debug);
        assert!(config.cleep.crashreport);
        assert_eq!(config.etcher.version, "v1.0.0");
        assert_eq!(config.cleep.other.get("custom"), Some(&serde_json::json!(1)));

        let on_disk: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["legacy"]["a"], 2);
    }

    #[test]
    fn test_update_persists_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::open(&path).unwrap();

        store.update(|c| c.etcher.version = "v2.0.0".into()).unwrap();

        let reopened = ConfigStore::open(&path).unwrap();
        assert_eq!(reopened.get().unwrap().etcher.version, "v2.0.0");
        assert!(!dir.path().join(".config.json.tmp").exists());
    }

    #[test]
    fn test_failed_write_keeps_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::open(&path).unwrap();

        // Replace the target with a directory so the rename fails.
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        let result = store.update(|c| c.cleep.debug = true);
        assert!(result.is_err());
        assert!(!store.get().unwrap().cleep.debug);
    }

    #[test]
    fn test_set_section() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(&dir.path().join("config.json")).unwrap();

        let config = store
            .set_section(
                "proxy",
                serde_json::json!({"mode": "manualproxy", "host": "10.0.0.1", "port": 3128}),
            )
            .unwrap();
        assert_eq!(config.proxy.mode, ProxyMode::Manualproxy);
        assert_eq!(config.proxy.url().as_deref(), Some("http://10.0.0.1:3128"));

        assert!(matches!(
            store.set_section("devices", serde_json::json!({})),
            Err(StoreError::UnknownSection(_))
        ));
        assert!(matches!(
            store.set_section("proxy", serde_json::json!({"port": "nope"})),
            Err(StoreError::Json(_))
        ));
    }

    #[test]
    fn test_proxy_url() {
        let mut proxy = ProxySection::default();
        assert!(proxy.url().is_none());
        proxy.mode = ProxyMode::Manualproxy;
        assert!(proxy.url().is_none());
        proxy.host = "https://proxy.lan".into();
        proxy.port = 8080;
        assert_eq!(proxy.url().as_deref(), Some("https://proxy.lan:8080"));
    }
}
