//! Container creation: per-user data directory, config build, readiness

use std::collections::HashMap;

use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, HostConfigLogConfig, Mount, MountTypeEnum};
use chrono::Utc;
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::{Configuration, ResourceTier};
use crate::error::{BackplaneError, Result};

use super::manager::{ContainerInfo, ContainerManager, UserConfig};

/// Create, start, and register a container for a user.
///
/// Fails as a unit: any step failing removes partial artifacts before
/// returning `ContainerCreateFailed` (readiness failures keep their own
/// `ContainerStartupTimeout` kind).
pub(super) async fn create_container(
    manager: &ContainerManager,
    user_id: &str,
    user_config: &UserConfig,
) -> Result<ContainerInfo> {
    let config = manager.configuration();
    let name = ContainerManager::container_name(user_id);
    let tier = user_config.tier;

    let user_dir = config.system.data_directory.join(user_id);
    tokio::fs::create_dir_all(user_dir.join(".claude"))
        .await
        .map_err(|e| {
            BackplaneError::ContainerCreateFailed(format!("data directory: {}", e))
        })?;

    ensure_image_exists(manager, &config.docker.image).await?;

    let container_config = build_container_config(config, user_id, tier, &user_dir);

    let options = CreateContainerOptions {
        name: name.as_str(),
        platform: None,
    };

    let created = manager
        .docker()
        .create_container(Some(options), container_config)
        .await
        .map_err(|e| BackplaneError::ContainerCreateFailed(e.to_string()))?;

    let container_id = created.id;

    // From here on a runtime object exists; clean it up on any failure
    if let Err(e) = start_and_register(manager, user_id, &container_id, &name, tier).await {
        remove_partial(manager, &name).await;
        return Err(e);
    }

    info!("Created container {} for user {} (tier {})", name, user_id, tier);

    manager
        .get_by_user(user_id)
        .ok_or_else(|| BackplaneError::Internal("created container missing from cache".into()))
}

async fn start_and_register(
    manager: &ContainerManager,
    user_id: &str,
    container_id: &str,
    name: &str,
    tier: ResourceTier,
) -> Result<()> {
    manager
        .docker()
        .start_container::<String>(name, None)
        .await
        .map_err(|e| BackplaneError::ContainerCreateFailed(format!("start: {}", e)))?;

    manager.wait_for_ready(name).await?;

    let now = Utc::now();
    let info = ContainerInfo {
        container_id: container_id.to_string(),
        container_name: name.to_string(),
        user_id: user_id.to_string(),
        tier,
        created_at: now,
        last_active: now,
    };

    // Creation is the one place a registry write is load-bearing: a container
    // the registry does not know about would leak across restarts
    let mut record = crate::database::ContainerRecord::new(
        info.user_id.clone(),
        info.container_id.clone(),
        info.container_name.clone(),
    );
    record.created_at = info.created_at;
    record.last_active = info.last_active;
    manager
        .registry()
        .upsert(&record)
        .await
        .map_err(|e| BackplaneError::ContainerCreateFailed(format!("registry: {}", e)))?;

    manager.cache_insert(info);
    Ok(())
}

async fn remove_partial(manager: &ContainerManager, name: &str) {
    let options = RemoveContainerOptions {
        force: true,
        v: false,
        ..Default::default()
    };
    match manager.docker().remove_container(name, Some(options)).await {
        Ok(()) => debug!("Removed partially-created container {}", name),
        Err(e) => warn!("Failed to remove partial container {}: {}", name, e),
    }
}

/// Build the full container configuration for a user.
///
/// The labels are the mandatory identity carrier; the deterministic name is
/// a convenience on top.
fn build_container_config(
    config: &Configuration,
    user_id: &str,
    tier: ResourceTier,
    user_dir: &std::path::Path,
) -> Config<String> {
    let limits = config.tiers.limits(tier);

    let mut env = vec![
        format!("USER_ID={}", user_id),
        format!("USER_TIER={}", tier),
        "NODE_ENV=production".to_string(),
        format!(
            "CLAUDE_CONFIG_DIR={}/.claude",
            config.system.workspace_root
        ),
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
    ];

    // Forward upstream provider credentials; nothing else from the host
    // environment may leak into the container
    if let Some(url) = &config.upstream.base_url {
        env.push(format!("ANTHROPIC_BASE_URL={}", url));
    }
    if let Some(token) = &config.upstream.auth_token {
        env.push(format!("ANTHROPIC_AUTH_TOKEN={}", token));
    }
    if let Some(model) = &config.upstream.model {
        env.push(format!("ANTHROPIC_MODEL={}", model));
    }

    let mounts = vec![Mount {
        target: Some(config.system.workspace_root.clone()),
        source: Some(user_dir.to_string_lossy().to_string()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(false),
        ..Default::default()
    }];

    let mut labels = HashMap::new();
    labels.insert("user".to_string(), user_id.to_string());
    labels.insert("managed".to_string(), "true".to_string());
    labels.insert("tier".to_string(), tier.to_string());
    labels.insert("created".to_string(), Utc::now().to_rfc3339());

    let host_config = HostConfig {
        mounts: Some(mounts),
        memory: Some(limits.memory_bytes),
        cpu_quota: Some(limits.cpu_quota),
        cpu_period: Some(limits.cpu_period),
        network_mode: Some(config.docker.network.clone()),
        log_config: Some(HostConfigLogConfig {
            typ: Some("json-file".to_string()),
            config: Some({
                let mut cfg = HashMap::new();
                cfg.insert("max-size".to_string(), "10m".to_string());
                cfg.insert("max-file".to_string(), "3".to_string());
                cfg
            }),
        }),
        ..Default::default()
    };

    Config {
        image: Some(config.docker.image.clone()),
        env: Some(env),
        labels: Some(labels),
        working_dir: Some(config.system.workspace_root.clone()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Ensure the runtime image exists, pulling if necessary
async fn ensure_image_exists(manager: &ContainerManager, image: &str) -> Result<()> {
    match manager.docker().inspect_image(image).await {
        Ok(_) => {
            debug!("Image {} already present", image);
            return Ok(());
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            info!("Image {} not found, pulling", image);
        }
        Err(e) => {
            warn!("Error inspecting image {}: {}", image, e);
        }
    }

    let options = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };

    let mut stream = manager.docker().create_image(Some(options), None, None);

    while let Some(result) = stream.next().await {
        match result {
            Ok(progress) => {
                if let Some(status) = progress.status {
                    debug!("Pull {}: {}", image, status);
                }
            }
            Err(e) => {
                error!("Failed to pull image {}: {}", image, e);
                return Err(BackplaneError::ContainerCreateFailed(format!(
                    "image pull: {}",
                    e
                )));
            }
        }
    }

    info!("Pulled image {}", image);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Configuration {
        let mut config = Configuration::for_tests();
        config.upstream.base_url = Some("https://llm-proxy.internal".into());
        config.upstream.auth_token = Some("sk-test".into());
        config
    }

    fn env_of(config: &Config<String>) -> Vec<String> {
        config.env.clone().unwrap_or_default()
    }

    #[test]
    fn test_config_carries_identity_env() {
        let cfg = test_config();
        let built =
            build_container_config(&cfg, "7", ResourceTier::Pro, std::path::Path::new("/tmp/7"));

        let env = env_of(&built);
        assert!(env.contains(&"USER_ID=7".to_string()));
        assert!(env.contains(&"USER_TIER=pro".to_string()));
        assert!(env.contains(&"NODE_ENV=production".to_string()));
        assert!(env.contains(&"CLAUDE_CONFIG_DIR=/workspace/.claude".to_string()));
    }

    #[test]
    fn test_config_forwards_upstream_only_when_set() {
        let mut cfg = test_config();
        let built =
            build_container_config(&cfg, "7", ResourceTier::Free, std::path::Path::new("/tmp/7"));
        assert!(env_of(&built)
            .iter()
            .any(|e| e == "ANTHROPIC_BASE_URL=https://llm-proxy.internal"));

        cfg.upstream = Default::default();
        let built =
            build_container_config(&cfg, "7", ResourceTier::Free, std::path::Path::new("/tmp/7"));
        assert!(!env_of(&built)
            .iter()
            .any(|e| e.starts_with("ANTHROPIC_")));
    }

    #[test]
    fn test_config_applies_tier_limits() {
        let cfg = test_config();
        let built = build_container_config(
            &cfg,
            "7",
            ResourceTier::Enterprise,
            std::path::Path::new("/tmp/7"),
        );

        let host = built.host_config.unwrap();
        let expected = cfg.tiers.limits(ResourceTier::Enterprise);
        assert_eq!(host.memory, Some(expected.memory_bytes));
        assert_eq!(host.cpu_quota, Some(expected.cpu_quota));
        assert_eq!(host.cpu_period, Some(expected.cpu_period));
    }

    #[test]
    fn test_config_labels_carry_identity() {
        let cfg = test_config();
        let built =
            build_container_config(&cfg, "42", ResourceTier::Free, std::path::Path::new("/tmp"));

        let labels = built.labels.unwrap();
        assert_eq!(labels.get("user").map(String::as_str), Some("42"));
        assert_eq!(labels.get("managed").map(String::as_str), Some("true"));
        assert_eq!(labels.get("tier").map(String::as_str), Some("free"));
        assert!(labels.contains_key("created"));
    }

    #[test]
    fn test_workspace_mount_binds_user_dir() {
        let cfg = test_config();
        let built = build_container_config(
            &cfg,
            "7",
            ResourceTier::Free,
            std::path::Path::new("/data/users/7"),
        );

        let mounts = built.host_config.unwrap().mounts.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].source.as_deref(), Some("/data/users/7"));
        assert_eq!(mounts[0].target.as_deref(), Some("/workspace"));
        assert_eq!(mounts[0].read_only, Some(false));
    }
}
