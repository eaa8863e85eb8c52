//! Flashing tool update commands.

use cleep_shared::{CleepError, ErrorKind};

use super::{route, Services};
use crate::messagebus::{CommandContext, CommandOk, CommandResult, CommandRouter};

pub fn register(router: &mut CommandRouter, services: &Services) {
    route(router, services, "check_tool_updates", &[], check_tool_updates);
    route(router, services, "get_tool_update_status", &[], get_tool_update_status);
}

/// Check now. An available update is installed in the background.
async fn check_tool_updates(services: Services, _: CommandContext) -> CommandResult {
    let update = services
        .updater
        .check()
        .await
        .ok_or_else(|| CleepError::new(ErrorKind::CommandError, "Tool updater stopped"))?;
    Ok(CommandOk::data(update))
}

async fn get_tool_update_status(services: Services, _: CommandContext) -> CommandResult {
    Ok(CommandOk::data(services.updater.status()))
}

#[cfg(test)]
mod tests {
    use super::super::{core_router, testing};
    use crate::messagebus::MessageRequest;
    use serde_json::Map;

    #[tokio::test]
    async fn test_check_without_host_build() {
        let dir = tempfile::tempdir().unwrap();
        let services = testing::services(dir.path()).await;
        let router = core_router(&services);

        let response = router
            .dispatch(&MessageRequest::command("check_tool_updates", Map::new()).to("core"))
            .await;
        assert!(!response.error);
        assert_eq!(response.data["available"], false);

        let response = router
            .dispatch(&MessageRequest::command("get_tool_update_status", Map::new()).to("core"))
            .await;
        assert_eq!(response.data["status"], "idle");
        assert!(!response.data["last_check"].is_null());
    }
}
