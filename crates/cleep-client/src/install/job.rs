use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use cleep_shared::types::{DownloadStatus, InstallStatus};

use super::flash::{ConsoleLine, FlashConsole, FlashError, FlasherSpec};
use super::progress::ProgressParser;
use super::{CancelToken, InstallProgress, InstallRequest};
use crate::download::{DownloadError, DownloadProgress, Downloader};
use crate::events::{UiPush, UiTopic};
use crate::state::AppContext;

/// Terminal state of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JobOutcome {
    pub status: InstallStatus,
    pub error: Option<String>,
}

impl JobOutcome {
    fn done() -> Self {
        Self {
            status: InstallStatus::Done,
            error: None,
        }
    }

    fn canceled() -> Self {
        Self {
            status: InstallStatus::Canceled,
            error: None,
        }
    }

    pub fn failed(status: InstallStatus, error: impl ToString) -> Self {
        Self {
            status,
            error: Some(error.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Publishes the job progress on the `install` topic.
///
/// Only actual changes of status or percent are pushed. Phases only move
/// forward and the percent never goes backwards within a phase.
#[derive(Clone)]
pub(crate) struct ProgressReporter {
    ui: UiPush,
    shared: Arc<Mutex<InstallProgress>>,
}

impl ProgressReporter {
    pub fn new(ui: UiPush, shared: Arc<Mutex<InstallProgress>>) -> Self {
        Self { ui, shared }
    }

    fn lock(&self) -> MutexGuard<'_, InstallProgress> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn snapshot(&self) -> InstallProgress {
        self.lock().clone()
    }

    /// Reset for a new job. Nothing is pushed until the first phase starts.
    pub fn begin(&self, request: &InstallRequest) {
        *self.lock() = InstallProgress {
            drive: Some(request.drive.clone()),
            url: Some(request.url.clone()),
            ..InstallProgress::default()
        };
    }

    pub fn download(&self, progress: &DownloadProgress) {
        if progress.status.is_terminal() && progress.status != DownloadStatus::Done {
            return;
        }
        let mut status: InstallStatus = progress.status.into();
        if progress.status == DownloadStatus::Done && self.lock().status == InstallStatus::DownloadingNosize {
            status = InstallStatus::DownloadingNosize;
        }
        self.update(status, progress.percent, "");
    }

    pub fn update(&self, status: InstallStatus, percent: i32, eta: &str) {
        let snapshot = {
            let mut current = self.lock();
            if current.status.is_terminal() || phase_rank(status) < phase_rank(current.status) {
                return;
            }
            let percent = if status == current.status && percent >= 0 {
                percent.max(current.percent)
            } else {
                percent
            };
            if status == current.status && percent == current.percent {
                return;
            }
            current.status = status;
            current.percent = percent;
            current.total_percent = status.total_percent(percent);
            current.eta = eta.to_string();
            current.clone()
        };
        debug!(status = ?snapshot.status, percent = snapshot.percent, "Install progress");
        self.ui.push(UiTopic::Install, snapshot);
    }

    pub fn finish(&self, outcome: &JobOutcome) {
        let snapshot = {
            let mut current = self.lock();
            current.status = outcome.status;
            if outcome.status == InstallStatus::Done {
                current.percent = 100;
            }
            current.total_percent = outcome.status.total_percent(current.percent);
            current.eta = String::new();
            current.error = outcome.error.clone();
            current.clone()
        };
        info!(status = ?snapshot.status, error = ?snapshot.error, "Install finished");
        self.ui.push(UiTopic::Install, snapshot);
    }
}

fn phase_rank(status: InstallStatus) -> u8 {
    match status {
        InstallStatus::Idle => 0,
        InstallStatus::Downloading | InstallStatus::DownloadingNosize => 1,
        InstallStatus::RequestWritePermissions => 2,
        InstallStatus::Flashing => 3,
        InstallStatus::Validating => 4,
        _ => 5,
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

fn write_wifi_file(ctx: &AppContext, request: &InstallRequest) -> std::io::Result<Option<PathBuf>> {
    let Some(wifi) = &request.wifi else {
        return Ok(None);
    };
    let path = ctx.paths.wifi_file();
    let content = serde_json::to_vec(&wifi.to_credential_file())?;
    std::fs::write(&path, content)?;
    debug!(path = %path.display(), ssid = %wifi.ssid, "Wifi credential file written");
    Ok(Some(path))
}

/// Run one install to its terminal state, cleanup included.
pub(crate) async fn run_job(
    ctx: Arc<AppContext>,
    request: InstallRequest,
    cancel: CancelToken,
    reporter: ProgressReporter,
) -> JobOutcome {
    let mut downloader = Downloader::with_cancel(ctx.http(), &ctx.paths.cache_dir, cancel.flag());

    let (wifi_file, outcome) = match write_wifi_file(&ctx, &request) {
        Ok(wifi_file) => {
            let outcome = pipeline(&ctx, &request, &cancel, &reporter, &mut downloader, wifi_file.as_deref()).await;
            (wifi_file, outcome)
        }
        Err(e) => {
            warn!(error = %e, "Failed to write wifi credential file");
            (None, JobOutcome::failed(InstallStatus::Error, e))
        }
    };

    if let Some(path) = wifi_file {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove wifi credential file");
        }
    }
    downloader.discard_own();
    outcome
}

async fn pipeline(
    ctx: &AppContext,
    request: &InstallRequest,
    cancel: &CancelToken,
    reporter: &ProgressReporter,
    downloader: &mut Downloader,
    wifi: Option<&Path>,
) -> JobOutcome {
    info!(url = %request.url, drive = %request.drive, "Install started");

    let image = match downloader
        .download(
            &request.url,
            request.checksum.as_deref(),
            request.cache_key.as_deref(),
            |p| reporter.download(&p),
        )
        .await
    {
        Ok(path) => path,
        Err(DownloadError::Canceled) => return JobOutcome::canceled(),
        Err(e) => return JobOutcome::failed(e.status().into(), e),
    };

    if cancel.is_canceled() {
        return JobOutcome::canceled();
    }
    reporter.update(InstallStatus::RequestWritePermissions, 0, "");

    let Some(spec) = FlasherSpec::resolve(ctx) else {
        return JobOutcome::failed(InstallStatus::Error, FlashError::NoFlasher);
    };
    if cancel.is_canceled() {
        return JobOutcome::canceled();
    }

    let spawned = tokio::select! {
        spawned = FlashConsole::spawn(&spec, &request.drive, &image, wifi) => spawned,
        _ = cancel.canceled() => return JobOutcome::canceled(),
    };
    let mut console = match spawned {
        Ok(console) => console,
        Err(e) => return JobOutcome::failed(InstallStatus::Error, e),
    };

    let mut parser = ProgressParser::default();
    let mut killed = false;
    let code = loop {
        tokio::select! {
            line = console.next() => match line {
                Some(ConsoleLine::Stdout(line)) => {
                    if let Some(p) = parser.feed(&line) {
                        reporter.update(p.status, i32::from(p.percent), &p.eta);
                    }
                }
                Some(ConsoleLine::Stderr(line)) => debug!(line, "Flasher stderr"),
                Some(ConsoleLine::Exit(code)) => break code,
                None => break -1,
            },
            _ = cancel.canceled(), if !killed => {
                killed = true;
                console.kill();
            }
        }
    };

    if killed || cancel.is_canceled() {
        JobOutcome::canceled()
    } else if code == 0 {
        JobOutcome::done()
    } else {
        JobOutcome::failed(InstallStatus::ErrorFlash, format!("Flasher exited with code {code}"))
    }
}
