//! Loopback relay between the desktop and an elevated flasher.
//!
//! When the flasher must run in a separate elevated process, its output
//! cannot be piped back directly. The desktop listens on a loopback port and
//! launches the `cleep-elevate` helper elevated; the helper connects back,
//! runs the flasher and relays its output as line frames:
//!
//! ```text
//! helper  -> desktop   O <stdout line>
//! helper  -> desktop   E <stderr line>
//! helper  -> desktop   X <exit code>
//! desktop -> helper    K               (kill the flasher)
//! ```

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::flash::{pump_lines, ConsoleLine, FlashError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stdout(String),
    Stderr(String),
    Exit(i32),
    Kill,
}

impl Frame {
    pub fn encode(&self) -> String {
        match self {
            Self::Stdout(line) => format!("O {line}\n"),
            Self::Stderr(line) => format!("E {line}\n"),
            Self::Exit(code) => format!("X {code}\n"),
            Self::Kill => "K\n".to_string(),
        }
    }

    pub fn decode(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (tag, rest) = match line.split_once(' ') {
            Some((tag, rest)) => (tag, rest),
            None => (line, ""),
        };
        match tag {
            "O" => Some(Self::Stdout(rest.to_string())),
            "E" => Some(Self::Stderr(rest.to_string())),
            "X" => rest.trim().parse().ok().map(Self::Exit),
            "K" => Some(Self::Kill),
            _ => None,
        }
    }
}

impl From<ConsoleLine> for Frame {
    fn from(line: ConsoleLine) -> Self {
        match line {
            ConsoleLine::Stdout(l) => Self::Stdout(l),
            ConsoleLine::Stderr(l) => Self::Stderr(l),
            ConsoleLine::Exit(code) => Self::Exit(code),
        }
    }
}

/// Loopback listener waiting for the helper.
pub async fn bind_loopback() -> std::io::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// Wait for the helper to connect back.
pub async fn accept_helper(listener: &TcpListener, timeout: Duration) -> Result<TcpStream, FlashError> {
    match tokio::time::timeout(timeout, listener.accept()).await {
        Ok(Ok((stream, peer))) => {
            debug!(%peer, "Elevation helper connected");
            Ok(stream)
        }
        Ok(Err(e)) => Err(FlashError::Io(e)),
        Err(_) => Err(FlashError::HelperTimeout(timeout.as_secs())),
    }
}

/// Helper side: run `program` and relay its output to the desktop
/// listening on `port`. Returns the flasher exit code.
pub async fn relay(port: u16, program: &str, args: &[String]) -> anyhow::Result<i32> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    info!(program, "Flasher started by helper");

    let (tx, mut rx) = mpsc::channel(64);
    let stdout = child.stdout.take().map(|out| {
        tokio::spawn(pump_lines(out, ConsoleLine::Stdout, tx.clone()))
    });
    let stderr = child.stderr.take().map(|err| {
        tokio::spawn(pump_lines(err, ConsoleLine::Stderr, tx.clone()))
    });
    drop(tx);

    let mut commands = BufReader::new(read_half).lines();
    let mut killed = false;
    let mut output_open = true;

    let status = loop {
        tokio::select! {
            line = rx.recv(), if output_open => match line {
                Some(line) => {
                    write_half.write_all(Frame::from(line).encode().as_bytes()).await?;
                }
                None => output_open = false,
            },
            command = commands.next_line(), if !killed => match command {
                Ok(Some(line)) if Frame::decode(&line) == Some(Frame::Kill) => {
                    warn!("Kill requested by desktop");
                    killed = true;
                    let _ = child.start_kill();
                }
                Ok(Some(_)) => {}
                // Desktop gone: nobody is left to read the output.
                Ok(None) | Err(_) => {
                    killed = true;
                    let _ = child.start_kill();
                }
            },
            status = child.wait(), if !output_open => break status?,
        }
    };

    for task in [stdout, stderr].into_iter().flatten() {
        let _ = task.await;
    }
    let code = status.code().unwrap_or(-1);
    let _ = write_half.write_all(Frame::Exit(code).encode().as_bytes()).await;
    let _ = write_half.shutdown().await;
    Ok(code)
}
