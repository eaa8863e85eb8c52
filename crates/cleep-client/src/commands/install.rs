//! Install worker commands.

use serde_json::{json, Value};

use cleep_shared::{CleepError, ErrorKind};

use super::{blocking, route, Services};
use crate::install::InstallRequest;
use crate::messagebus::{CommandContext, CommandOk, CommandResult, CommandRouter, ParamSpec, ParamType};

pub fn register(router: &mut CommandRouter, services: &Services) {
    route(
        router,
        services,
        "start_install",
        &[
            ParamSpec::required("url", ParamType::String),
            ParamSpec::required("drive", ParamType::String),
            ParamSpec::optional("wifi", ParamType::Object),
            ParamSpec::optional("checksum", ParamType::String),
            ParamSpec::optional("cache_key", ParamType::String),
        ],
        start_install,
    );
    route(router, services, "cancel_install", &[], cancel_install);
    route(router, services, "get_install_status", &[], get_install_status);
}

async fn start_install(services: Services, ctx: CommandContext) -> CommandResult {
    let request: InstallRequest = serde_json::from_value(Value::Object(ctx.params))
        .map_err(|e| CleepError::new(ErrorKind::InvalidParameter, e.to_string()))?;

    let drives = services.drives.clone();
    let drives = blocking(move || {
        drives
            .list(false)
            .map_err(|e| CleepError::new(e.kind(), e.to_string()))
    })
    .await?;
    if !drives.iter().any(|d| d.path == request.drive) {
        return Err(CleepError::new(
            ErrorKind::InvalidParameter,
            format!("Drive {} is not a removable drive", request.drive),
        ));
    }

    services.installer.start(request).await?;
    Ok(CommandOk::info("Installation started"))
}

async fn cancel_install(services: Services, _: CommandContext) -> CommandResult {
    let canceled = services.installer.cancel().await;
    Ok(CommandOk::data(json!({ "canceled": canceled })))
}

async fn get_install_status(services: Services, _: CommandContext) -> CommandResult {
    Ok(CommandOk::data(services.installer.status()))
}

#[cfg(test)]
mod tests {
    use super::super::{core_router, testing};
    use crate::messagebus::MessageRequest;
    use cleep_shared::ErrorKind;
    use serde_json::{json, Map, Value};

    fn request(command: &str, params: Value) -> MessageRequest {
        let params: Map<String, Value> = serde_json::from_value(params).unwrap();
        MessageRequest::command(command, params).to("core")
    }

    #[tokio::test]
    async fn test_start_install_validation() {
        let dir = tempfile::tempdir().unwrap();
        let services = testing::services(dir.path()).await;
        let router = core_router(&services);

        let response = router
            .dispatch(&request("start_install", json!({"url": "http://127.0.0.1:9/a.img"})))
            .await;
        assert_eq!(response.kind, Some(ErrorKind::MissingParameter));

        let response = router
            .dispatch(&request(
                "start_install",
                json!({
                    "url": "http://127.0.0.1:9/a.img",
                    "drive": "/dev/sdz",
                    "wifi": {"ssid": "home", "encryption": "wpa2", "password": ""}
                }),
            ))
            .await;
        assert_eq!(response.kind, Some(ErrorKind::InvalidParameter));

        let response = router
            .dispatch(&request(
                "start_install",
                json!({"url": "http://127.0.0.1:9/a.img", "drive": "/dev/sdz", "wifi": {"ssid": 3}}),
            ))
            .await;
        assert_eq!(response.kind, Some(ErrorKind::InvalidParameter));
    }

    #[tokio::test]
    async fn test_start_install_rejects_unknown_drive() {
        let dir = tempfile::tempdir().unwrap();
        let services = testing::services(dir.path()).await;
        let router = core_router(&services);

        let response = router
            .dispatch(&request(
                "start_install",
                json!({"url": "http://127.0.0.1:9/a.img", "drive": "/dev/nvme0n1"}),
            ))
            .await;
        assert_eq!(response.kind, Some(ErrorKind::InvalidParameter));
        assert!(response.message.contains("/dev/nvme0n1"));

        let response = router.dispatch(&request("get_install_status", json!({}))).await;
        assert_eq!(response.data["status"], "idle");
    }

    #[tokio::test]
    async fn test_idle_status_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let services = testing::services(dir.path()).await;
        let router = core_router(&services);

        let response = router.dispatch(&request("get_install_status", json!({}))).await;
        assert_eq!(response.data["status"], "idle");

        let response = router.dispatch(&request("cancel_install", json!({}))).await;
        assert_eq!(response.data["canceled"], false);
    }
}
