//! Install worker.
//!
//! Single-slot worker running download, privileged flash and validation of
//! a removable medium. A submission is rejected while a job is in flight.
//! Every accepted job ends with exactly one terminal status on the
//! `install` topic, pushed by the worker once the slot is free again.

mod elevate;
mod flash;
mod job;
mod progress;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use cleep_shared::types::InstallStatus;
use cleep_shared::wifi::WifiConfig;
use cleep_shared::{CleepError, ErrorKind};

use crate::download::Checksum;
use crate::state::AppContext;

pub use elevate::{relay, Frame};
pub use flash::{ConsoleLine, Elevation, FlashConsole, FlashError, FlasherSpec};
pub use progress::{parse_line, FlashProgress, ProgressParser};

use job::{run_job, JobOutcome, ProgressReporter};

/// Submission from the UI.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstallRequest {
    pub url: String,
    pub drive: String,
    #[serde(default)]
    pub wifi: Option<WifiConfig>,
    /// Expected sha1, sha256 or md5 of the image.
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub cache_key: Option<String>,
}

/// Snapshot pushed on the `install` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallProgress {
    pub status: InstallStatus,
    /// Percent of the current phase, -1 while unknown.
    pub percent: i32,
    pub total_percent: u8,
    pub eta: String,
    pub drive: Option<String>,
    pub url: Option<String>,
    pub error: Option<String>,
}

impl Default for InstallProgress {
    fn default() -> Self {
        Self {
            status: InstallStatus::Idle,
            percent: 0,
            total_percent: 0,
            eta: String::new(),
            drive: None,
            url: None,
            error: None,
        }
    }
}

/// Cooperative cancellation shared by the worker and a job.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(watch::channel(false).0),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.tx.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Flag polled by the download engine between chunks.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    /// Resolves once canceled.
    pub async fn canceled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|canceled| *canceled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

enum InstallCommand {
    Start {
        request: InstallRequest,
        reply: oneshot::Sender<Result<(), CleepError>>,
    },
    Cancel(oneshot::Sender<bool>),
}

#[derive(Clone)]
pub struct InstallHandle {
    tx: mpsc::Sender<InstallCommand>,
    reporter: ProgressReporter,
}

impl InstallHandle {
    pub async fn start(&self, request: InstallRequest) -> Result<(), CleepError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(InstallCommand::Start { request, reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Request cancellation of the running job. False when idle.
    pub async fn cancel(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(InstallCommand::Cancel(reply)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn status(&self) -> InstallProgress {
        self.reporter.snapshot()
    }
}

fn stopped() -> CleepError {
    CleepError::new(ErrorKind::CommandError, "Install worker stopped")
}

struct ActiveJob {
    cancel: CancelToken,
    task: JoinHandle<JobOutcome>,
}

struct Installer {
    ctx: Arc<AppContext>,
    reporter: ProgressReporter,
    active: Option<ActiveJob>,
}

impl Installer {
    fn validate(&self, request: &InstallRequest) -> Result<(), CleepError> {
        if request.url.trim().is_empty() {
            return Err(CleepError::new(ErrorKind::InvalidParameter, "Image url is missing"));
        }
        if request.drive.trim().is_empty() {
            return Err(CleepError::new(ErrorKind::InvalidParameter, "Drive is missing"));
        }
        if request.url.starts_with("file://") {
            let allowed = self.ctx.config.read(|c| c.cleep.isolocal).unwrap_or(false);
            if !allowed {
                return Err(CleepError::new(
                    ErrorKind::InvalidParameter,
                    "Local images are disabled",
                ));
            }
        }
        if let Some(checksum) = request.checksum.as_deref().filter(|c| !c.is_empty()) {
            Checksum::parse(checksum)
                .map_err(|e| CleepError::new(ErrorKind::InvalidParameter, e.to_string()))?;
        }
        if let Some(wifi) = &request.wifi {
            wifi.validate()?;
        }
        Ok(())
    }

    fn start(&mut self, request: InstallRequest) -> Result<(), CleepError> {
        if self.active.is_some() {
            return Err(CleepError::new(
                ErrorKind::CommandError,
                "An installation is already running",
            ));
        }
        self.validate(&request)?;

        let cancel = CancelToken::new();
        self.reporter.begin(&request);
        let task = tokio::spawn(run_job(
            self.ctx.clone(),
            request,
            cancel.clone(),
            self.reporter.clone(),
        ));
        self.active = Some(ActiveJob { cancel, task });
        Ok(())
    }

    fn cancel(&mut self) -> bool {
        match &self.active {
            Some(job) if !job.cancel.is_canceled() => {
                info!("Install cancel requested");
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn on_command(&mut self, command: InstallCommand) {
        match command {
            InstallCommand::Start { request, reply } => {
                let _ = reply.send(self.start(request));
            }
            InstallCommand::Cancel(reply) => {
                let _ = reply.send(self.cancel());
            }
        }
    }

    fn on_finished(&mut self, result: Result<JobOutcome, tokio::task::JoinError>) {
        self.active = None;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Install job crashed");
                self.ctx.report("install.job", &e);
                JobOutcome::failed(InstallStatus::Error, e)
            }
        };
        self.reporter.finish(&outcome);
    }

    async fn run(mut self, mut rx: mpsc::Receiver<InstallCommand>) {
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                result = job_finished(&mut self.active) => self.on_finished(result),
            }
        }

        if let Some(job) = self.active.take() {
            job.cancel.cancel();
            let result = job.task.await;
            self.on_finished(result);
        }
        debug!("Install worker stopped");
    }
}

async fn job_finished(active: &mut Option<ActiveJob>) -> Result<JobOutcome, tokio::task::JoinError> {
    match active {
        Some(job) => (&mut job.task).await,
        None => std::future::pending().await,
    }
}

pub fn spawn_installer(ctx: Arc<AppContext>) -> InstallHandle {
    let (tx, rx) = mpsc::channel(16);
    let reporter = ProgressReporter::new(ctx.ui.clone(), Arc::new(Mutex::new(InstallProgress::default())));
    let installer = Installer {
        ctx,
        reporter: reporter.clone(),
        active: None,
    };
    tokio::spawn(installer.run(rx));
    InstallHandle { tx, reporter }
}
