//! Flashing tool self-update.
//!
//! Checks the release feed once at startup and then once a day after the
//! configured `autoupdate_time`. A newer release is downloaded through the
//! download cache and handed to the installer script. The installed
//! version is only bumped when the script exits with 0.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use cleep_shared::constants::SUBPROCESS_TIMEOUT_SECS;
use cleep_shared::types::ToolUpdate;

use crate::download::{DownloadError, Downloader};
use crate::events::{UiPush, UiTopic};
use crate::feeds::ToolFeed;
use crate::state::AppContext;

const SCHEDULE_TICK_SECS: u64 = 30;
const DEFAULT_UPDATE_TIME: &str = "12:00";

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Update offer has no download url")]
    Incomplete,

    #[error("No tool installer configured")]
    NoInstaller,

    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("Failed to run installer: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Installer timed out after {0}s")]
    Timeout(u64),

    #[error("Installer exited with code {0}")]
    Failed(i32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    #[default]
    Idle,
    Downloading,
    Installing,
    Done,
    Error,
}

/// Snapshot pushed on the `updates` topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateState {
    pub status: UpdateStatus,
    pub percent: i32,
    pub installed: String,
    pub update: ToolUpdate,
    pub last_check: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Once a day, on the first tick at or after the configured time.
#[derive(Debug, Default)]
struct Schedule {
    last_run: Option<NaiveDate>,
}

impl Schedule {
    fn time_of(value: &str) -> NaiveTime {
        NaiveTime::parse_from_str(value.trim(), "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(DEFAULT_UPDATE_TIME, "%H:%M"))
            .unwrap_or(NaiveTime::MIN)
    }

    fn due(&self, at: NaiveTime, now: NaiveDateTime) -> bool {
        now.time() >= at && self.last_run != Some(now.date())
    }

    fn mark(&mut self, now: NaiveDateTime) {
        self.last_run = Some(now.date());
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Publisher {
    ui: UiPush,
    state: Arc<Mutex<UpdateState>>,
}

impl Publisher {
    fn lock(&self) -> MutexGuard<'_, UpdateState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply `f` and push when the snapshot changed.
    fn set(&self, f: impl FnOnce(&mut UpdateState)) {
        let changed = {
            let mut state = self.lock();
            let before = state.clone();
            f(&mut state);
            (*state != before).then(|| state.clone())
        };
        if let Some(snapshot) = changed {
            self.ui.push(UiTopic::Updates, snapshot);
        }
    }
}

enum UpdaterCommand {
    Check(oneshot::Sender<ToolUpdate>),
}

#[derive(Clone)]
pub struct UpdaterHandle {
    tx: mpsc::Sender<UpdaterCommand>,
    publisher: Publisher,
}

impl UpdaterHandle {
    /// Run a check now. Resolves with the offer before any install starts.
    pub async fn check(&self) -> Option<ToolUpdate> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(UpdaterCommand::Check(reply)).await.ok()?;
        rx.await.ok()
    }

    pub fn status(&self) -> UpdateState {
        self.publisher.lock().clone()
    }
}

struct Updater {
    ctx: Arc<AppContext>,
    feed: ToolFeed,
    publisher: Publisher,
    install_timeout: Duration,
}

impl Updater {
    async fn cycle(&self, reply: Option<oneshot::Sender<ToolUpdate>>) {
        let installed = self
            .ctx
            .config
            .read(|c| c.etcher.version.clone())
            .unwrap_or_default();
        let update = self.feed.check(&self.ctx.http(), &installed).await;

        self.publisher.set(|s| {
            s.installed = installed.clone();
            s.update = update.clone();
            s.last_check = Some(Utc::now());
        });
        if let Some(reply) = reply {
            let _ = reply.send(update.clone());
        }
        if !update.available {
            return;
        }

        match self.install(&update).await {
            Ok(version) => {
                info!(version = %version, "Tool updated");
                self.publisher.set(|s| {
                    s.status = UpdateStatus::Done;
                    s.installed = version;
                    s.update.available = false;
                    s.error = None;
                });
            }
            Err(e) => {
                error!(error = %e, "Tool update failed");
                self.publisher.set(|s| {
                    s.status = UpdateStatus::Error;
                    s.error = Some(e.to_string());
                });
            }
        }
    }

    async fn install(&self, update: &ToolUpdate) -> Result<String, UpdateError> {
        let (Some(url), Some(filename)) = (update.url.as_deref(), update.filename.as_deref()) else {
            return Err(UpdateError::Incomplete);
        };
        let version = update.version.clone().unwrap_or_default();
        let (installer, install_dir) = self
            .ctx
            .config
            .read(|c| {
                let install_dir = c
                    .etcher
                    .install_dir
                    .clone()
                    .unwrap_or_else(|| self.ctx.paths.config_dir.join("etcher"));
                (c.etcher.installer.clone(), install_dir)
            })
            .map_err(|_| UpdateError::NoInstaller)?;
        let installer = installer.ok_or(UpdateError::NoInstaller)?;

        info!(version = %version, url, "Downloading tool update");
        self.publisher.set(|s| {
            s.status = UpdateStatus::Downloading;
            s.percent = 0;
            s.error = None;
        });
        let mut downloader = Downloader::new(self.ctx.http(), &self.ctx.paths.cache_dir);
        let publisher = self.publisher.clone();
        let archive = downloader
            .download(url, None, Some(filename), move |p| {
                publisher.set(|s| s.percent = p.percent);
            })
            .await?;

        self.publisher.set(|s| s.status = UpdateStatus::Installing);
        self.run_installer(&installer, &install_dir, &archive).await?;

        if let Err(e) = self.ctx.config.update(|c| c.etcher.version = version.clone()) {
            warn!(error = %e, "Failed to persist tool version");
            self.ctx.report("updater.persist", &e);
        }
        Ok(version)
    }

    async fn run_installer(&self, installer: &Path, install_dir: &Path, archive: &Path) -> Result<(), UpdateError> {
        debug!(installer = %installer.display(), archive = %archive.display(), "Running tool installer");
        let mut command = tokio::process::Command::new(installer);
        command
            .arg(install_dir)
            .arg(archive)
            .arg(install_dir)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.install_timeout, command.output())
            .await
            .map_err(|_| UpdateError::Timeout(self.install_timeout.as_secs()))??;
        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            debug!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Tool installer output"
            );
            return Err(UpdateError::Failed(code));
        }
        Ok(())
    }

    async fn run(self, mut rx: mpsc::Receiver<UpdaterCommand>) {
        let mut schedule = Schedule::default();
        let mut ticker = tokio::time::interval(Duration::from_secs(SCHEDULE_TICK_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let now = Local::now().naive_local();
        if schedule.due(self.update_time(), now) {
            schedule.mark(now);
        }
        self.cycle(None).await;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(UpdaterCommand::Check(reply)) => self.cycle(Some(reply)).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    let now = Local::now().naive_local();
                    if schedule.due(self.update_time(), now) {
                        schedule.mark(now);
                        info!("Daily tool update check");
                        self.cycle(None).await;
                    }
                }
            }
        }
        debug!("Tool updater stopped");
    }

    fn update_time(&self) -> NaiveTime {
        let value = self
            .ctx
            .config
            .read(|c| c.cleep.autoupdate_time.clone())
            .unwrap_or_default();
        Schedule::time_of(&value)
    }
}

pub fn spawn_updater(ctx: Arc<AppContext>, feed: ToolFeed) -> UpdaterHandle {
    let (tx, rx) = mpsc::channel(8);
    let publisher = Publisher {
        ui: ctx.ui.clone(),
        state: Arc::new(Mutex::new(UpdateState::default())),
    };
    let updater = Updater {
        ctx,
        feed,
        publisher: publisher.clone(),
        install_timeout: Duration::from_secs(SUBPROCESS_TIMEOUT_SECS),
    };
    tokio::spawn(updater.run(rx));
    UpdaterHandle { tx, publisher }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{context, serve_http};
    use axum::extract::State;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    fn at(date: (i32, u32, u32), time: (u32, u32)) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(time.0, time.1, 0)
            .unwrap()
    }

    #[test]
    fn test_schedule_runs_once_a_day() {
        let noon = Schedule::time_of("12:00");
        let mut schedule = Schedule::default();

        assert!(!schedule.due(noon, at((2024, 3, 1), (11, 59))));
        assert!(schedule.due(noon, at((2024, 3, 1), (12, 0))));
        schedule.mark(at((2024, 3, 1), (12, 0)));
        assert!(!schedule.due(noon, at((2024, 3, 1), (18, 30))));
        // A host asleep at noon catches up on wake.
        assert!(schedule.due(noon, at((2024, 3, 2), (21, 0))));
    }

    #[test]
    fn test_schedule_invalid_time_defaults_to_noon() {
        assert_eq!(Schedule::time_of("25:99"), Schedule::time_of("12:00"));
        assert_eq!(
            Schedule::time_of(" 07:15 "),
            NaiveTime::from_hms_opt(7, 15, 0).unwrap()
        );
    }

    async fn feed_server() -> String {
        async fn releases(State(base): State<String>) -> Json<serde_json::Value> {
            Json(json!([{
                "tag_name": "v2.0.0",
                "assets": [{
                    "name": "tool-v2.0.0-linux-x64.zip",
                    "browser_download_url": format!("{base}/asset.zip"),
                    "size": 7
                }]
            }]))
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let router = Router::new()
            .route("/releases", get(releases))
            .route("/asset.zip", get(|| async { "archive" }))
            .with_state(base.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        base
    }

    fn updater(ctx: Arc<AppContext>, base: &str) -> Updater {
        let feed = ToolFeed::new(&format!("{base}/releases"), Some("linux-x64"), &ctx.paths.cache_dir);
        Updater {
            publisher: Publisher {
                ui: ctx.ui.clone(),
                state: Arc::new(Mutex::new(UpdateState::default())),
            },
            ctx,
            feed,
            install_timeout: Duration::from_secs(5),
        }
    }

    #[cfg(unix)]
    fn installer(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("install.sh");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_update_installs_and_bumps_version() {
        let base = feed_server().await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let script = installer(dir.path(), "#!/bin/sh\nmkdir -p \"$1\"\ncp \"$2\" \"$3/installed.zip\"\n");
        let install_dir = dir.path().join("tool");
        ctx.config
            .update(|c| {
                c.etcher.version = "1.0.0".into();
                c.etcher.installer = Some(script.clone());
                c.etcher.install_dir = Some(install_dir.clone());
            })
            .unwrap();
        let mut tap = ctx.ui.tap();

        let updater = updater(ctx.clone(), &base);
        let (reply, rx) = oneshot::channel();
        updater.cycle(Some(reply)).await;

        let offer = rx.await.unwrap();
        assert!(offer.available);
        assert_eq!(offer.version.as_deref(), Some("2.0.0"));

        let state = updater.publisher.lock().clone();
        assert_eq!(state.status, UpdateStatus::Done);
        assert_eq!(state.installed, "2.0.0");
        assert_eq!(ctx.config.read(|c| c.etcher.version.clone()).unwrap(), "2.0.0");
        assert_eq!(std::fs::read(install_dir.join("installed.zip")).unwrap(), b"archive");

        let mut statuses = Vec::new();
        while let Ok((topic, value)) = tap.try_recv() {
            assert_eq!(topic, UiTopic::Updates);
            let state: UpdateState = serde_json::from_value(value).unwrap();
            if statuses.last() != Some(&state.status) {
                statuses.push(state.status);
            }
        }
        assert_eq!(
            statuses,
            vec![
                UpdateStatus::Idle,
                UpdateStatus::Downloading,
                UpdateStatus::Installing,
                UpdateStatus::Done
            ]
        );

        // Installed now, the next check offers nothing.
        updater.cycle(None).await;
        assert!(!updater.publisher.lock().update.available);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_installer_keeps_version() {
        let base = feed_server().await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let script = installer(dir.path(), "#!/bin/sh\nexit 3\n");
        ctx.config
            .update(|c| {
                c.etcher.version = "1.0.0".into();
                c.etcher.installer = Some(script.clone());
            })
            .unwrap();

        let updater = updater(ctx.clone(), &base);
        updater.cycle(None).await;

        let state = updater.publisher.lock().clone();
        assert_eq!(state.status, UpdateStatus::Error);
        assert_eq!(state.error.as_deref(), Some("Installer exited with code 3"));
        assert_eq!(ctx.config.read(|c| c.etcher.version.clone()).unwrap(), "1.0.0");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_installer_timeout() {
        let base = feed_server().await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let script = installer(dir.path(), "#!/bin/sh\nexec sleep 30\n");
        ctx.config
            .update(|c| c.etcher.installer = Some(script.clone()))
            .unwrap();

        let mut updater = updater(ctx.clone(), &base);
        updater.install_timeout = Duration::from_millis(300);
        updater.cycle(None).await;

        let state = updater.publisher.lock().clone();
        assert_eq!(state.status, UpdateStatus::Error);
        assert!(state.error.unwrap().contains("timed out"));
        assert_eq!(ctx.config.read(|c| c.etcher.version.clone()).unwrap(), "");
    }

    #[tokio::test]
    async fn test_missing_installer_is_an_error() {
        let base = feed_server().await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let updater = updater(ctx, &base);
        updater.cycle(None).await;
        let state = updater.publisher.lock().clone();
        assert_eq!(state.status, UpdateStatus::Error);
        assert_eq!(state.error.as_deref(), Some("No tool installer configured"));
    }

    #[tokio::test]
    async fn test_handle_check_replies() {
        let base = feed_server().await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        ctx.config.update(|c| c.etcher.version = "2.0.0".into()).unwrap();
        let feed = ToolFeed::new(&format!("{base}/releases"), Some("linux-x64"), &ctx.paths.cache_dir);

        let handle = spawn_updater(ctx, feed);
        let offer = handle.check().await.unwrap();
        assert!(!offer.available);
        assert_eq!(offer.version.as_deref(), Some("2.0.0"));
        assert_eq!(handle.status().installed, "2.0.0");
        assert!(handle.status().last_check.is_some());
    }
}
