//! Command handlers of the `core` recipient.
//!
//! Each sub-module groups related commands by domain and registers them on
//! the router built by [`core_router`]. Handlers receive the shared
//! [`Services`] and the validated parameters of the request.

pub mod config;
pub mod devices;
pub mod install;
pub mod probes;
pub mod updates;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use cleep_net::BusHandle;
use cleep_platform::{DriveInventory, WifiScanner};
use cleep_shared::{CleepError, ErrorKind};

use crate::devices::DevicesHandle;
use crate::feeds::ImageCatalog;
use crate::install::InstallHandle;
use crate::messagebus::{CommandContext, CommandResult, CommandRouter, ParamSpec};
use crate::state::AppContext;
use crate::updater::UpdaterHandle;

/// Recipient name of the application commands.
pub const CORE_RECIPIENT: &str = "core";

/// Everything the handlers need, cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub ctx: Arc<AppContext>,
    pub devices: DevicesHandle,
    /// Absent when the peer bus failed to start.
    pub bus: Option<BusHandle>,
    pub installer: InstallHandle,
    pub updater: UpdaterHandle,
    pub images: Arc<ImageCatalog>,
    pub drives: Arc<DriveInventory>,
    pub wifi: Arc<WifiScanner>,
}

/// Router serving every command of the `core` recipient.
pub fn core_router(services: &Services) -> CommandRouter {
    let mut router = CommandRouter::new(CORE_RECIPIENT);
    config::register(&mut router, services);
    devices::register(&mut router, services);
    install::register(&mut router, services);
    probes::register(&mut router, services);
    updates::register(&mut router, services);
    router
}

/// Register `handler` with its own clone of the services.
fn route<F, Fut>(
    router: &mut CommandRouter,
    services: &Services,
    command: &str,
    params: &[ParamSpec],
    handler: F,
) where
    F: Fn(Services, CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CommandResult> + Send + 'static,
{
    let services = services.clone();
    router.register(command, params, move |ctx| handler(services.clone(), ctx));
}

fn command_error(error: impl Display) -> CleepError {
    CleepError::new(ErrorKind::CommandError, error.to_string())
}

/// Run a blocking host query off the runtime threads.
async fn blocking<T, F>(f: F) -> Result<T, CleepError>
where
    F: FnOnce() -> Result<T, CleepError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(command_error)?
}
