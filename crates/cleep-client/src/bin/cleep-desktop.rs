//! Cleep desktop control plane.
//!
//! Usage: `cleep-desktop [config_path]`

use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

use cleep_client::{App, RuntimeOptions};

const DEFAULT_FILTER: &str =
    "cleep_client=debug,cleep_net=debug,cleep_platform=info,cleep_store=info,warn";

fn debug_enabled(options: &RuntimeOptions) -> bool {
    if options.debug {
        return true;
    }
    let path = match &options.config_path {
        Some(path) => path.clone(),
        None => match cleep_store::ConfigStore::default_path() {
            Ok(path) => path,
            Err(_) => return false,
        },
    };
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|doc| doc["cleep"]["debug"].as_bool())
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = RuntimeOptions::from_env().with_args(std::env::args().skip(1));

    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    let default_filter = if debug_enabled(&options) { "debug" } else { DEFAULT_FILTER };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(true)
        .init();

    info!("Starting Cleep desktop v{}", env!("CARGO_PKG_VERSION"));
    debug!(?options, "Runtime options");

    // -----------------------------------------------------------------------
    // 2. Start the application
    // -----------------------------------------------------------------------
    let app = App::start(options).await?;

    // The UI transport is external; log what it would receive.
    let mut pushes = app.ctx.ui.tap();
    let logger = tokio::spawn(async move {
        while let Some((topic, payload)) = pushes.recv().await {
            debug!(topic = topic.as_str(), %payload, "UI push");
        }
    });

    // -----------------------------------------------------------------------
    // 3. Run until interrupted
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    logger.abort();
    app.shutdown().await;
    Ok(())
}
