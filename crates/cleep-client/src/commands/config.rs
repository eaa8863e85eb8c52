//! Configuration commands.

use serde_json::{json, Value};
use tracing::{info, warn};

use cleep_shared::{CleepError, ErrorKind};
use cleep_store::config::EDITABLE_SECTIONS;

use super::{command_error, route, Services};
use crate::events::UiTopic;
use crate::messagebus::{CommandContext, CommandOk, CommandResult, CommandRouter, ParamSpec, ParamType};

pub fn register(router: &mut CommandRouter, services: &Services) {
    route(router, services, "get_config", &[], get_config);
    route(
        router,
        services,
        "set_config",
        &[
            ParamSpec::required("section", ParamType::String),
            ParamSpec::required("values", ParamType::Object),
        ],
        set_config,
    );
    route(router, services, "version", &[], version);
}

/// Whole configuration document.
async fn get_config(services: Services, _: CommandContext) -> CommandResult {
    let config = services.ctx.config.get().map_err(command_error)?;
    Ok(CommandOk::data(config))
}

/// Replace one section and apply its runtime side effects.
async fn set_config(services: Services, ctx: CommandContext) -> CommandResult {
    let section: String = ctx.require("section")?;
    let values: Value = ctx.require("values")?;
    if !EDITABLE_SECTIONS.contains(&section.as_str()) {
        return Err(CleepError::new(
            ErrorKind::InvalidParameter,
            format!("Section \"{section}\" can't be edited"),
        ));
    }

    let config = services
        .ctx
        .config
        .set_section(&section, values)
        .map_err(|e| CleepError::new(ErrorKind::InvalidParameter, e.to_string()))?;
    info!(section, "Configuration updated");

    match section.as_str() {
        "proxy" => {
            if let Err(e) = services.ctx.apply_proxy(&config.proxy) {
                warn!(error = %e, "Invalid proxy settings");
                return Err(CleepError::new(ErrorKind::InvalidParameter, e.to_string()));
            }
            services.images.invalidate();
        }
        "cleep" => {
            services.ctx.crash.set_enabled(config.cleep.crashreport);
            services.images.invalidate();
        }
        _ => {}
    }

    services
        .ctx
        .ui
        .push(UiTopic::Message, json!({ "config": &config }));
    Ok(CommandOk::data(config))
}

async fn version(services: Services, _: CommandContext) -> CommandResult {
    let tool = services
        .ctx
        .config
        .read(|c| c.etcher.version.clone())
        .map_err(command_error)?;
    Ok(CommandOk::data(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "tool": tool,
    })))
}
