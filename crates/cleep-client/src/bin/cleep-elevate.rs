//! Elevated flasher relay.
//!
//! Usage: `cleep-elevate <port> <program> [args...]`
//!
//! Started with administrator rights by the install worker. Runs `program`,
//! streams its output to the worker listening on `127.0.0.1:<port>` and
//! exits with the program's exit code.

use anyhow::Context;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let port: u16 = args
        .next()
        .context("missing relay port")?
        .parse()
        .context("invalid relay port")?;
    let program = args.next().context("missing program")?;
    let rest: Vec<String> = args.collect();

    let code = cleep_client::install::relay(port, &program, &rest).await?;
    std::process::exit(code);
}
