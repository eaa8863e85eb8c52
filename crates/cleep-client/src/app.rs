//! Application wiring.
//!
//! [`App::start`] opens the configuration, sweeps the download cache, then
//! starts the workers in dependency order: message bus, peer bus, device
//! registry, install worker, tool updater and finally the `core` command
//! recipient. The application-ready event is raised last, which flushes
//! the broadcasts deferred during startup.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use cleep_net::BusHandle;
use cleep_platform::{CommandRunner, DriveInventory, HostRunner, WifiScanner};
use cleep_store::ConfigStore;

use crate::bus_bridge::{spawn_propagation, start_bus, BRIDGE_RECIPIENT};
use crate::commands::{core_router, Services, CORE_RECIPIENT};
use crate::crash::TracingCrashReporter;
use crate::devices::spawn_registry;
use crate::download::purge;
use crate::events::UiPush;
use crate::feeds::{FeedUrls, ImageCatalog, ToolFeed};
use crate::install::spawn_installer;
use crate::messagebus::{serve, MessageBus};
use crate::state::{AppContext, AppPaths, RuntimeOptions};
use crate::updater::spawn_updater;

pub struct App {
    pub ctx: Arc<AppContext>,
    /// Entry point of the UI transport.
    pub messages: MessageBus,
    pub services: Services,
    bus: Option<BusHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    pub async fn start(options: RuntimeOptions) -> anyhow::Result<Self> {
        // -------------------------------------------------------------------
        // 1. Configuration and context
        // -------------------------------------------------------------------
        let config_path = match &options.config_path {
            Some(path) => path.clone(),
            None => ConfigStore::default_path()?,
        };
        let config = Arc::new(ConfigStore::open(&config_path)?);
        config.update(|c| c.cleep.version = env!("CARGO_PKG_VERSION").to_string())?;
        let crashreport = config.read(|c| c.cleep.crashreport)?;
        info!(path = %config_path.display(), "Configuration loaded");

        let paths = AppPaths::new(&config_path, &options);
        let ctx = Arc::new(AppContext::new(
            config,
            Arc::new(TracingCrashReporter::new(crashreport)),
            UiPush::new(),
            paths,
            options,
        )?);

        if let Err(e) = purge(&ctx.paths.cache_dir, false) {
            warn!(error = %e, "Startup cache sweep failed");
        }

        // -------------------------------------------------------------------
        // 2. Message plane and peer bus
        // -------------------------------------------------------------------
        let messages = MessageBus::new();
        let mut tasks = vec![messages.spawn_reaper()];

        let (bus, notifications) = if ctx.options.offline {
            info!("Offline mode, peer bus disabled");
            (None, mpsc::channel(1).1)
        } else {
            match start_bus(&ctx) {
                Ok((bus, notifications)) => (Some(bus), notifications),
                Err(e) => {
                    warn!(error = %e, "Peer bus failed to start, devices unavailable");
                    ctx.report("app.bus", &e);
                    (None, mpsc::channel(1).1)
                }
            }
        };

        // -------------------------------------------------------------------
        // 3. Workers
        // -------------------------------------------------------------------
        let devices = spawn_registry(ctx.clone(), messages.clone(), notifications)?;
        let installer = spawn_installer(ctx.clone());
        let updater = spawn_updater(ctx.clone(), ToolFeed::for_host(&ctx.paths.cache_dir));
        let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner);

        let services = Services {
            ctx: ctx.clone(),
            devices,
            bus: bus.clone(),
            installer,
            updater,
            images: Arc::new(ImageCatalog::new(FeedUrls::default())),
            drives: Arc::new(DriveInventory::for_host(runner.clone())),
            wifi: Arc::new(WifiScanner::for_host(runner)),
        };

        // -------------------------------------------------------------------
        // 4. Recipients, then ready
        // -------------------------------------------------------------------
        let router = core_router(&services);
        info!(commands = router.commands().len(), "Core commands registered");
        tasks.push(tokio::spawn(serve(messages.subscribe(CORE_RECIPIENT), router)));
        if let Some(bus) = &bus {
            tasks.push(spawn_propagation(
                messages.subscribe(BRIDGE_RECIPIENT),
                bus.clone(),
            ));
        }

        messages.app_ready();
        info!("Cleep desktop v{} ready", env!("CARGO_PKG_VERSION"));

        Ok(Self {
            ctx,
            messages,
            services,
            bus,
            tasks,
        })
    }

    pub async fn shutdown(self) {
        info!("Shutting down");
        if let Some(bus) = &self.bus {
            bus.shutdown().await;
        }
        self.services.installer.cancel().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cleep_shared::constants::TMP_PREFIX;
    use serde_json::{json, Map};

    fn options(dir: &std::path::Path) -> RuntimeOptions {
        RuntimeOptions {
            config_path: Some(dir.join("conf").join("cleepdesktop.json")),
            cache_dir: Some(dir.join("cache")),
            offline: true,
            ..RuntimeOptions::default()
        }
    }

    #[tokio::test]
    async fn test_start_serves_core_commands() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cache")).unwrap();
        let stale = dir.path().join("cache").join(format!("{TMP_PREFIX}stale"));
        std::fs::write(&stale, b"x").unwrap();

        let app = App::start(options(dir.path())).await.unwrap();
        assert!(app.messages.is_ready());
        assert!(!stale.exists());

        let response = app
            .messages
            .command(CORE_RECIPIENT, "version", Map::new(), "ui")
            .await;
        assert!(!response.error, "{}", response.message);
        assert_eq!(response.data["version"], env!("CARGO_PKG_VERSION"));

        let response = app
            .messages
            .command(CORE_RECIPIENT, "get_devices", Map::new(), "ui")
            .await;
        assert_eq!(response.data["unconfigured"], 0);

        let config = app.ctx.config.get().unwrap();
        assert_eq!(config.cleep.version, env!("CARGO_PKG_VERSION"));
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_command_and_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::start(options(dir.path())).await.unwrap();

        let response = app
            .messages
            .command(CORE_RECIPIENT, "format_disk", Map::new(), "ui")
            .await;
        assert_eq!(response.kind, Some(cleep_shared::ErrorKind::InvalidCommand));

        let params = json!({"x": 1}).as_object().cloned().unwrap();
        let response = app.messages.command("nobody", "ping", params, "ui").await;
        assert_eq!(response.kind, Some(cleep_shared::ErrorKind::InvalidModule));
        app.shutdown().await;
    }
}
