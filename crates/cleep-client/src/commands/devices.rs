//! Device registry and peer bus commands.

use serde_json::{json, Map, Value};
use tracing::info;

use cleep_net::BusHandle;
use cleep_shared::{CleepError, ErrorKind};

use super::{route, Services};
use crate::bus_bridge::to_external;
use crate::messagebus::{
    CommandContext, CommandOk, CommandResult, CommandRouter, MessageRequest, ParamSpec, ParamType,
};

pub fn register(router: &mut CommandRouter, services: &Services) {
    route(router, services, "get_devices", &[], get_devices);
    route(
        router,
        services,
        "delete_device",
        &[ParamSpec::required("device_uuid", ParamType::String)],
        delete_device,
    );
    route(
        router,
        services,
        "send_command_to_device",
        &[
            ParamSpec::required("device_uuid", ParamType::String),
            ParamSpec::required("command", ParamType::String),
            ParamSpec::required("to", ParamType::String),
            ParamSpec::optional("params", ParamType::Object),
            ParamSpec::optional("timeout", ParamType::Number),
        ],
        send_command_to_device,
    );
    route(
        router,
        services,
        "broadcast_event",
        &[
            ParamSpec::required("event", ParamType::String),
            ParamSpec::optional("params", ParamType::Object),
        ],
        broadcast_event,
    );
}

fn bus(services: &Services) -> Result<&BusHandle, CleepError> {
    services
        .bus
        .as_ref()
        .ok_or_else(|| CleepError::new(ErrorKind::DeviceOffline, "Peer bus is not running"))
}

async fn get_devices(services: Services, _: CommandContext) -> CommandResult {
    Ok(CommandOk::data(services.devices.snapshot().await))
}

async fn delete_device(services: Services, ctx: CommandContext) -> CommandResult {
    let uuid: String = ctx.require("device_uuid")?;
    if !services.devices.delete(&uuid).await {
        return Err(CleepError::new(
            ErrorKind::InvalidParameter,
            format!("Device \"{uuid}\" is unknown"),
        ));
    }
    info!(device = %uuid, "Device deleted");
    Ok(CommandOk::info("Device deleted"))
}

/// Whisper a command to one online device.
async fn send_command_to_device(services: Services, ctx: CommandContext) -> CommandResult {
    let uuid: String = ctx.require("device_uuid")?;
    let command: String = ctx.require("command")?;
    let to: String = ctx.require("to")?;
    let params: Map<String, Value> = ctx.get("params")?.unwrap_or_default();

    let bus = bus(&services)?;
    let Some(ident) = services.devices.ident_of(&uuid).await else {
        return Err(CleepError::new(
            ErrorKind::DeviceOffline,
            format!("Device \"{uuid}\" is offline"),
        ));
    };

    let mut request = MessageRequest::command(&command, params).to(&to);
    request.timeout = ctx.get("timeout")?;
    let message = to_external(&request, bus.ident());
    bus.send_to(&ident, message).await?;
    info!(device = %uuid, command, to, "Command sent to device");
    Ok(CommandOk::data(json!({ "device_uuid": uuid })))
}

/// Shout an event to every device.
async fn broadcast_event(services: Services, ctx: CommandContext) -> CommandResult {
    let event: String = ctx.require("event")?;
    let params: Map<String, Value> = ctx.get("params")?.unwrap_or_default();

    let bus = bus(&services)?;
    let message = to_external(&MessageRequest::event(&event, params), bus.ident());
    bus.broadcast(message).await?;
    Ok(CommandOk::default())
}
