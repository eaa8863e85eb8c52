//! Host probes, image catalog and download cache commands.

use serde_json::json;

use cleep_platform::ProbeError;
use cleep_shared::types::InstallStatus;
use cleep_shared::CleepError;

use super::{blocking, command_error, route, Services};
use crate::download::purge;
use crate::messagebus::{CommandContext, CommandOk, CommandResult, CommandRouter, ParamSpec, ParamType};

pub fn register(router: &mut CommandRouter, services: &Services) {
    route(router, services, "get_drives", &[], get_drives);
    route(router, services, "get_wifi_adapter", &[], get_wifi_adapter);
    route(router, services, "refresh_wifi_networks", &[], refresh_wifi_networks);
    route(router, services, "get_images", &[], get_images);
    route(router, services, "refresh_images", &[], refresh_images);
    route(
        router,
        services,
        "purge_cache",
        &[ParamSpec::optional("force_all", ParamType::Bool)],
        purge_cache,
    );
}

fn probe_error(e: ProbeError) -> CleepError {
    CleepError::new(e.kind(), e.to_string())
}

async fn get_drives(services: Services, _: CommandContext) -> CommandResult {
    let drives = services.drives.clone();
    let drives = blocking(move || drives.list(false).map_err(probe_error)).await?;
    Ok(CommandOk::data(drives))
}

async fn get_wifi_adapter(services: Services, _: CommandContext) -> CommandResult {
    let wifi = services.wifi.clone();
    let present = blocking(move || wifi.adapter_present(false).map_err(probe_error)).await?;
    Ok(CommandOk::data(json!({ "adapter": present })))
}

/// Forced scan, bypassing the probe cache.
async fn refresh_wifi_networks(services: Services, _: CommandContext) -> CommandResult {
    let wifi = services.wifi.clone();
    let status = blocking(move || wifi.status(true).map_err(probe_error)).await?;
    Ok(CommandOk::data(status))
}

async fn images(services: &Services, force: bool) -> CommandResult {
    let upstream = services
        .ctx
        .config
        .read(|c| c.cleep.isoraspios)
        .map_err(command_error)?;
    let images = services
        .images
        .images(&services.ctx.http(), upstream, force)
        .await;
    Ok(CommandOk::data(json!({ "images": images })))
}

async fn get_images(services: Services, _: CommandContext) -> CommandResult {
    images(&services, false).await
}

async fn refresh_images(services: Services, _: CommandContext) -> CommandResult {
    images(&services, true).await
}

async fn purge_cache(services: Services, ctx: CommandContext) -> CommandResult {
    let status = services.installer.status().status;
    if status != InstallStatus::Idle && !status.is_terminal() {
        return Err(command_error("Cache can't be purged while an install is running"));
    }
    let force_all = ctx.bool("force_all").unwrap_or(false);
    let cache_dir = services.ctx.paths.cache_dir.clone();
    let removed = blocking(move || purge(&cache_dir, force_all).map_err(command_error)).await?;
    Ok(CommandOk::data(json!({ "removed": removed })))
}

#[cfg(test)]
mod tests {
    use super::super::{core_router, testing};
    use crate::download::cached_path;
    use crate::messagebus::MessageRequest;
    use cleep_shared::constants::TMP_PREFIX;
    use serde_json::{json, Map, Value};

    fn request(command: &str, params: Value) -> MessageRequest {
        let params: Map<String, Value> = serde_json::from_value(params).unwrap();
        MessageRequest::command(command, params).to("core")
    }

    #[tokio::test]
    async fn test_probes() {
        let dir = tempfile::tempdir().unwrap();
        let services = testing::services(dir.path()).await;
        let router = core_router(&services);

        let response = router.dispatch(&request("get_drives", json!({}))).await;
        assert_eq!(response.data[0]["path"], "/dev/sdz");

        let response = router.dispatch(&request("get_wifi_adapter", json!({}))).await;
        assert_eq!(response.data["adapter"], true);

        let response = router.dispatch(&request("refresh_wifi_networks", json!({}))).await;
        assert_eq!(response.data["networks"][0]["ssid"], "home");
    }

    #[tokio::test]
    async fn test_images_offline_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let services = testing::services(dir.path()).await;
        let response = core_router(&services)
            .dispatch(&request("refresh_images", json!({})))
            .await;
        assert!(!response.error);
        assert_eq!(response.data["images"], json!([]));
    }

    #[tokio::test]
    async fn test_purge_cache() {
        let dir = tempfile::tempdir().unwrap();
        let services = testing::services(dir.path()).await;
        let cache = &services.ctx.paths.cache_dir;
        std::fs::write(cache.join(format!("{TMP_PREFIX}partial")), b"x").unwrap();
        std::fs::write(cached_path(cache, "flash.iso"), b"x").unwrap();
        let router = core_router(&services);

        let response = router.dispatch(&request("purge_cache", json!({}))).await;
        assert_eq!(response.data["removed"], 1);
        assert!(cached_path(cache, "flash.iso").exists());

        let response = router
            .dispatch(&request("purge_cache", json!({"force_all": true})))
            .await;
        assert_eq!(response.data["removed"], 1);
        assert!(!cached_path(cache, "flash.iso").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_purge_cache_refused_during_install() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        use crate::install::InstallRequest;
        use crate::state::RuntimeOptions;
        use cleep_shared::types::InstallStatus;
        use cleep_shared::ErrorKind;

        let dir = tempfile::tempdir().unwrap();
        let flasher = dir.path().join("flasher.sh");
        std::fs::write(&flasher, "#!/bin/sh\necho \"Flashing [=   ] 10% eta 20s\"\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&flasher, std::fs::Permissions::from_mode(0o755)).unwrap();
        let options = RuntimeOptions {
            flasher: Some(flasher),
            ..RuntimeOptions::default()
        };
        let services = testing::services_with(dir.path(), options).await;
        services
            .ctx
            .config
            .update(|c| {
                c.cleep.elevate = false;
                c.cleep.isolocal = true;
            })
            .unwrap();
        let cache = services.ctx.paths.cache_dir.clone();
        std::fs::write(cached_path(&cache, "flash.iso"), b"x").unwrap();
        let image = dir.path().join("local.img");
        std::fs::write(&image, b"image").unwrap();

        services
            .installer
            .start(InstallRequest {
                url: format!("file://{}", image.display()),
                drive: dir.path().join("sdcard").display().to_string(),
                wifi: None,
                checksum: None,
                cache_key: None,
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while services.installer.status().status != InstallStatus::Flashing {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let router = core_router(&services);
        let response = router
            .dispatch(&request("purge_cache", json!({"force_all": true})))
            .await;
        assert!(response.error);
        assert_eq!(response.kind, Some(ErrorKind::CommandError));
        assert!(cached_path(&cache, "flash.iso").exists());

        assert!(services.installer.cancel().await);
        tokio::time::timeout(Duration::from_secs(10), async {
            while !services.installer.status().status.is_terminal() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        let response = router
            .dispatch(&request("purge_cache", json!({"force_all": true})))
            .await;
        assert!(!response.error);
        assert!(!cached_path(&cache, "flash.iso").exists());
    }
}
