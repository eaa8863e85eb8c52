//! Flasher subprocess and its output console.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use cleep_platform::{CommandRunner, HostOs, HostRunner};
use cleep_shared::constants::ELEVATE_CONNECT_TIMEOUT_SECS;

use super::elevate::{accept_helper, bind_loopback, Frame};
use crate::state::AppContext;

/// Queue size of the console line channel.
const CONSOLE_QUEUE_SIZE: usize = 256;

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Flasher not installed")]
    NoFlasher,

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Elevation helper did not connect within {0}s")]
    HelperTimeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Flasher resolution
// ---------------------------------------------------------------------------

/// How the flasher gets its privileges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Elevation {
    /// Run as the current user.
    None,
    /// Prefix the command with a privileged-exec wrapper (`pkexec`).
    Wrapper(String),
    /// Launch the loopback relay helper elevated (Windows UAC, macOS
    /// administrator prompt).
    LoopbackHelper(PathBuf),
}

#[derive(Debug, Clone)]
pub struct FlasherSpec {
    pub program: PathBuf,
    pub config_dir: PathBuf,
    pub elevation: Elevation,
}

fn flasher_name() -> &'static str {
    if cfg!(windows) {
        "balena.exe"
    } else {
        "balena"
    }
}

fn helper_name() -> &'static str {
    if cfg!(windows) {
        "cleep-elevate.exe"
    } else {
        "cleep-elevate"
    }
}

impl FlasherSpec {
    /// Flasher configured for this host, `None` when not installed.
    ///
    /// Lookup order: `CLEEP_FLASHER`, the `etcher.flasher` setting, then the
    /// tool install directory.
    pub fn resolve(ctx: &AppContext) -> Option<Self> {
        let (tool, elevate) = ctx
            .config
            .read(|c| (c.etcher.clone(), c.cleep.elevate))
            .ok()?;

        let program = ctx
            .options
            .flasher
            .clone()
            .or(tool.flasher)
            .or_else(|| tool.install_dir.map(|dir| dir.join("bin").join(flasher_name())))?;
        if !program.exists() {
            debug!(path = %program.display(), "Flasher not found");
            return None;
        }

        let elevation = if elevate {
            host_elevation(HostOs::current())
        } else {
            Elevation::None
        };
        Some(Self {
            program,
            config_dir: ctx.paths.config_dir.clone(),
            elevation,
        })
    }

    /// `<config_dir> <drive> <image> <wifi_file_or_empty>`
    pub fn args(&self, drive: &str, image: &Path, wifi: Option<&Path>) -> Vec<String> {
        vec![
            self.config_dir.display().to_string(),
            drive.to_string(),
            image.display().to_string(),
            wifi.map(|p| p.display().to_string()).unwrap_or_default(),
        ]
    }
}

fn host_elevation(os: HostOs) -> Elevation {
    match os {
        HostOs::Linux if HostRunner.has_program("pkexec") => Elevation::Wrapper("pkexec".into()),
        HostOs::Windows | HostOs::MacOs => {
            let helper = std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join(helper_name())));
            match helper {
                Some(helper) => Elevation::LoopbackHelper(helper),
                None => Elevation::None,
            }
        }
        _ => {
            warn!(os = os.name(), "No privilege elevation available, running flasher as user");
            Elevation::None
        }
    }
}

/// Command elevating the relay helper on this host.
fn helper_launch(os: HostOs, helper: &Path, port: u16, program: &Path, args: &[String]) -> (String, Vec<String>) {
    let mut helper_args = vec![port.to_string(), program.display().to_string()];
    helper_args.extend(args.iter().cloned());

    match os {
        HostOs::Windows => {
            let quoted: Vec<String> = helper_args
                .iter()
                .map(|a| format!("'{}'", a.replace('\'', "''")))
                .collect();
            let script = format!(
                "Start-Process -Verb RunAs -WindowStyle Hidden -FilePath '{}' -ArgumentList {}",
                helper.display().to_string().replace('\'', "''"),
                quoted.join(",")
            );
            (
                "powershell".into(),
                vec!["-NoProfile".into(), "-NonInteractive".into(), "-Command".into(), script],
            )
        }
        HostOs::MacOs => {
            let mut words = vec![shell_quote(&helper.display().to_string())];
            words.extend(helper_args.iter().map(|a| shell_quote(a)));
            let script = format!(
                "do shell script \"{}\" with administrator privileges",
                words.join(" ").replace('\\', "\\\\").replace('"', "\\\"")
            );
            ("osascript".into(), vec!["-e".into(), script])
        }
        _ => (helper.display().to_string(), helper_args),
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleLine {
    Stdout(String),
    Stderr(String),
    Exit(i32),
}

/// Forward `reader` as lines, split on `\n` and `\r`.
pub(crate) async fn pump_lines<R>(mut reader: R, wrap: fn(String) -> ConsoleLine, tx: mpsc::Sender<ConsoleLine>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for byte in &buf[..n] {
            if *byte == b'\n' || *byte == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    if tx.send(wrap(line)).await.is_err() {
                        return;
                    }
                }
            } else {
                pending.push(*byte);
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(wrap(String::from_utf8_lossy(&pending).into_owned())).await;
    }
}

/// Running flasher: output lines, then a final [`ConsoleLine::Exit`].
pub struct FlashConsole {
    lines: mpsc::Receiver<ConsoleLine>,
    kill: Option<oneshot::Sender<()>>,
}

impl FlashConsole {
    /// Start the flasher as described by `spec`.
    pub async fn spawn(spec: &FlasherSpec, drive: &str, image: &Path, wifi: Option<&Path>) -> Result<Self, FlashError> {
        let args = spec.args(drive, image, wifi);
        info!(program = %spec.program.display(), drive, elevation = ?spec.elevation, "Starting flasher");

        match &spec.elevation {
            Elevation::None => Self::direct(&spec.program.display().to_string(), &args),
            Elevation::Wrapper(wrapper) => {
                let mut wrapped = vec![spec.program.display().to_string()];
                wrapped.extend(args);
                Self::direct(wrapper, &wrapped)
            }
            Elevation::LoopbackHelper(helper) => {
                let (listener, port) = bind_loopback().await?;
                let (program, launch_args) = helper_launch(HostOs::current(), helper, port, &spec.program, &args);
                let launcher = Command::new(&program)
                    .args(&launch_args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(|source| FlashError::Spawn { program, source })?;
                // The launcher exits as soon as the helper is started.
                tokio::spawn(async move {
                    let mut launcher = launcher;
                    let _ = launcher.wait().await;
                });

                let timeout = Duration::from_secs(ELEVATE_CONNECT_TIMEOUT_SECS);
                let stream = accept_helper(&listener, timeout).await?;
                Ok(Self::from_helper(stream))
            }
        }
    }

    /// Run `program` as a child of this process.
    pub fn direct(program: &str, args: &[String]) -> Result<Self, FlashError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FlashError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let (tx, lines) = mpsc::channel(CONSOLE_QUEUE_SIZE);
        let (kill, kill_rx) = oneshot::channel();
        tokio::spawn(supervise_child(child, tx, kill_rx));
        Ok(Self {
            lines,
            kill: Some(kill),
        })
    }

    /// Read the flasher output relayed by a connected helper.
    pub fn from_helper(stream: TcpStream) -> Self {
        let (tx, lines) = mpsc::channel(CONSOLE_QUEUE_SIZE);
        let (kill, kill_rx) = oneshot::channel();
        tokio::spawn(supervise_helper(stream, tx, kill_rx));
        Self {
            lines,
            kill: Some(kill),
        }
    }

    /// Next output line. `None` once the exit code has been delivered.
    pub async fn next(&mut self) -> Option<ConsoleLine> {
        self.lines.recv().await
    }

    /// Kill the flasher. The exit code still follows.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            warn!("Killing flasher");
            let _ = kill.send(());
        }
    }
}

async fn supervise_child(mut child: Child, tx: mpsc::Sender<ConsoleLine>, mut kill_rx: oneshot::Receiver<()>) {
    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump_lines(out, ConsoleLine::Stdout, tx.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump_lines(err, ConsoleLine::Stderr, tx.clone())));

    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    for task in [stdout, stderr].into_iter().flatten() {
        let _ = task.await;
    }
    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(error = %e, "Failed to wait for flasher");
            -1
        }
    };
    debug!(code, "Flasher exited");
    let _ = tx.send(ConsoleLine::Exit(code)).await;
}

async fn supervise_helper(stream: TcpStream, tx: mpsc::Sender<ConsoleLine>, mut kill_rx: oneshot::Receiver<()>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut frames = BufReader::new(read_half).lines();
    let mut kill_sent = false;

    let code = loop {
        tokio::select! {
            line = frames.next_line() => match line {
                Ok(Some(line)) => match Frame::decode(&line) {
                    Some(Frame::Stdout(l)) => {
                        let _ = tx.send(ConsoleLine::Stdout(l)).await;
                    }
                    Some(Frame::Stderr(l)) => {
                        let _ = tx.send(ConsoleLine::Stderr(l)).await;
                    }
                    Some(Frame::Exit(code)) => break code,
                    _ => debug!(line, "Unexpected helper frame"),
                },
                Ok(None) | Err(_) => {
                    warn!("Elevation helper disconnected without exit code");
                    break -1;
                }
            },
            _ = &mut kill_rx, if !kill_sent => {
                kill_sent = true;
                if let Err(e) = write_half.write_all(Frame::Kill.encode().as_bytes()).await {
                    warn!(error = %e, "Failed to forward kill to helper");
                }
            }
        }
    };
    let _ = tx.send(ConsoleLine::Exit(code)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut console: FlashConsole) -> Vec<ConsoleLine> {
        let mut lines = Vec::new();
        while let Some(line) = console.next().await {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_args_order() {
        let spec = FlasherSpec {
            program: PathBuf::from("/opt/tool/balena"),
            config_dir: PathBuf::from("/home/u/.config/cleep"),
            elevation: Elevation::None,
        };
        assert_eq!(
            spec.args("/dev/sdb", Path::new("/tmp/img"), None),
            vec!["/home/u/.config/cleep", "/dev/sdb", "/tmp/img", ""]
        );
        assert_eq!(
            spec.args("/dev/sdb", Path::new("/tmp/img"), Some(Path::new("/tmp/w")))[3],
            "/tmp/w"
        );
    }

    #[test]
    fn test_helper_launch_commands() {
        let args = vec!["a b".to_string()];
        let (program, launch) = helper_launch(HostOs::Windows, Path::new("C:\\h.exe"), 4000, Path::new("C:\\f.exe"), &args);
        assert_eq!(program, "powershell");
        assert!(launch[3].contains("-Verb RunAs"));
        assert!(launch[3].contains("'4000','C:\\f.exe','a b'"));

        let (program, launch) = helper_launch(HostOs::MacOs, Path::new("/Apps/h"), 4000, Path::new("/f"), &args);
        assert_eq!(program, "osascript");
        assert!(launch[1].contains("with administrator privileges"));
        assert!(launch[1].contains("'/Apps/h' '4000' '/f' 'a b'"));

        let (program, launch) = helper_launch(HostOs::Linux, Path::new("/h"), 1, Path::new("/f"), &[]);
        assert_eq!(program, "/h");
        assert_eq!(launch, vec!["1", "/f"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_direct_console_splits_carriage_returns() {
        let script = "printf 'Flashing [=] 10%% eta 1m\\rFlashing [==] 20%% eta 50s\\n'; echo oops >&2; exit 3";
        let console = FlashConsole::direct("sh", &["-c".to_string(), script.to_string()]).unwrap();
        let lines = collect(console).await;

        assert!(lines.contains(&ConsoleLine::Stdout("Flashing [=] 10% eta 1m".into())));
        assert!(lines.contains(&ConsoleLine::Stdout("Flashing [==] 20% eta 50s".into())));
        assert!(lines.contains(&ConsoleLine::Stderr("oops".into())));
        assert_eq!(lines.last(), Some(&ConsoleLine::Exit(3)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_direct_console_kill() {
        let mut console = FlashConsole::direct("sh", &["-c".to_string(), "echo started; exec sleep 30".to_string()]).unwrap();
        assert_eq!(console.next().await, Some(ConsoleLine::Stdout("started".into())));
        console.kill();
        let rest = tokio::time::timeout(Duration::from_secs(5), collect(console)).await.unwrap();
        assert!(matches!(rest.last(), Some(ConsoleLine::Exit(code)) if *code != 0));
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let err = FlashConsole::direct("/nonexistent/flasher", &[]).err().unwrap();
        assert!(matches!(err, FlashError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_relay_roundtrip() {
        let (listener, port) = bind_loopback().await.unwrap();
        let relay = tokio::spawn(async move {
            super::super::elevate::relay(
                port,
                "sh",
                &["-c".to_string(), "echo 'Validating [=] 99% eta 1s'; exit 0".to_string()],
            )
            .await
            .unwrap()
        });

        let stream = accept_helper(&listener, Duration::from_secs(5)).await.unwrap();
        let lines = collect(FlashConsole::from_helper(stream)).await;
        assert_eq!(
            lines,
            vec![
                ConsoleLine::Stdout("Validating [=] 99% eta 1s".into()),
                ConsoleLine::Exit(0)
            ]
        );
        assert_eq!(relay.await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_relay_kill() {
        let (listener, port) = bind_loopback().await.unwrap();
        let relay = tokio::spawn(async move {
            super::super::elevate::relay(port, "sh", &["-c".to_string(), "echo go; exec sleep 30".to_string()])
                .await
                .unwrap()
        });

        let stream = accept_helper(&listener, Duration::from_secs(5)).await.unwrap();
        let mut console = FlashConsole::from_helper(stream);
        assert_eq!(console.next().await, Some(ConsoleLine::Stdout("go".into())));
        console.kill();
        let rest = tokio::time::timeout(Duration::from_secs(5), collect(console)).await.unwrap();
        assert!(matches!(rest.last(), Some(ConsoleLine::Exit(code)) if *code != 0));
        assert_ne!(relay.await.unwrap(), 0);
    }
}
