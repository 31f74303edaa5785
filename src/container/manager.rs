//! Container manager - per-user container lifecycle

use std::sync::Arc;
use std::time::Duration;

use bollard::container::{RemoveContainerOptions, StopContainerOptions};
use bollard::models::ContainerInspectResponse;
use bollard::Docker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Configuration, ResourceTier};
use crate::database::{ContainerRecord, ContainerStatus, Database};
use crate::error::{BackplaneError, Result};

/// Per-call user settings consulted when a container has to be created
#[derive(Debug, Clone, Default)]
pub struct UserConfig {
    pub tier: ResourceTier,
}

/// A live container owned by the manager
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerInfo {
    pub container_id: String,
    pub container_name: String,
    pub user_id: String,
    pub tier: ResourceTier,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Owns every per-user container on this node.
///
/// The in-memory cache is authoritative while the process runs; the registry
/// database carries state across restarts. Construct once in the composition
/// root and share via `Arc`.
pub struct ContainerManager {
    docker: Docker,
    config: Arc<Configuration>,
    db: Arc<Database>,
    containers: DashMap<String, ContainerInfo>,
    // Serializes lookup-or-create per user so concurrent callers reuse one
    // container instead of racing Docker on the name
    create_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ContainerManager {
    pub fn new(docker: Docker, config: Arc<Configuration>, db: Arc<Database>) -> Self {
        Self {
            docker,
            config,
            db,
            containers: DashMap::new(),
            create_locks: DashMap::new(),
        }
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub(crate) fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Deterministic container name for a user
    pub fn container_name(user_id: &str) -> String {
        format!("agent-user-{}", user_id)
    }

    /// Idempotent lookup-or-create.
    ///
    /// Cache hit wins; otherwise the live runtime is inspected by
    /// deterministic name; only then is a container created.
    pub async fn get_or_create_container(
        &self,
        user_id: &str,
        user_config: &UserConfig,
    ) -> Result<ContainerInfo> {
        if let Some(entry) = self.containers.get(user_id) {
            let info = entry.value().clone();
            // Release the shard guard before touch() takes a write lock
            drop(entry);
            self.touch(user_id);
            return Ok(info);
        }

        let lock = self
            .create_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A concurrent caller may have created the container while we waited
        if let Some(entry) = self.containers.get(user_id) {
            return Ok(entry.value().clone());
        }

        let name = Self::container_name(user_id);
        match self.docker.inspect_container(&name, None).await {
            Ok(details) => {
                let running = details
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);

                if !running {
                    info!("Container {} exists but is stopped, starting", name);
                    self.docker
                        .start_container::<String>(&name, None)
                        .await
                        .map_err(BackplaneError::Docker)?;
                    self.wait_for_ready(&name).await?;
                }

                let info = self.info_from_inspect(user_id, &details)?;
                self.containers.insert(user_id.to_string(), info.clone());
                self.persist_running(&info).await;
                Ok(info)
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => self.create_container(user_id, user_config).await,
            Err(e) => Err(BackplaneError::Docker(e)),
        }
    }

    /// Unconditional create: data dir, config, create, start, readiness,
    /// registry record, cache. Implemented in `create.rs`.
    pub async fn create_container(
        &self,
        user_id: &str,
        user_config: &UserConfig,
    ) -> Result<ContainerInfo> {
        super::create::create_container(self, user_id, user_config).await
    }

    /// Stop a user's container. Idempotent: stopping an already-stopped
    /// container is success.
    pub async fn stop_container(&self, user_id: &str, timeout_secs: i64) -> Result<()> {
        let name = Self::container_name(user_id);

        match self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(BackplaneError::ContainerNotFound(user_id.to_string())),
            Err(e) => return Err(BackplaneError::Docker(e)),
        }

        if let Some((_, info)) = self.containers.remove(user_id) {
            if let Err(e) = self
                .db
                .mark_status(&info.container_id, ContainerStatus::Stopped)
                .await
            {
                warn!("Registry write failed marking {} stopped: {}", name, e);
            }
        }

        info!("Stopped container {}", name);
        Ok(())
    }

    /// Start a previously-created container and wait for readiness
    pub async fn start_container(&self, user_id: &str) -> Result<ContainerInfo> {
        let name = Self::container_name(user_id);

        self.docker
            .start_container::<String>(&name, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => BackplaneError::ContainerNotFound(user_id.to_string()),
                other => BackplaneError::Docker(other),
            })?;

        self.wait_for_ready(&name).await?;

        let details = self
            .docker
            .inspect_container(&name, None)
            .await
            .map_err(BackplaneError::Docker)?;
        let info = self.info_from_inspect(user_id, &details)?;
        self.containers.insert(user_id.to_string(), info.clone());
        self.persist_running(&info).await;

        info!("Started container {}", name);
        Ok(info)
    }

    /// Best-effort stop, then remove. The registry record is deleted even if
    /// the runtime already reported the container gone.
    pub async fn destroy_container(&self, user_id: &str, remove_volume: bool) -> Result<()> {
        let name = Self::container_name(user_id);

        let container_id = self
            .containers
            .remove(user_id)
            .map(|(_, info)| info.container_id);

        let options = RemoveContainerOptions {
            force: true,
            v: false,
            ..Default::default()
        };

        match self.docker.remove_container(&name, Some(options)).await {
            Ok(()) => info!("Destroyed container {}", name),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!("Container {} already gone", name),
            Err(e) => return Err(BackplaneError::Docker(e)),
        }

        let container_id = match container_id {
            Some(id) => Some(id),
            None => match self.db.get_by_user(user_id).await {
                Ok(record) => record.map(|r| r.container_id),
                Err(_) => None,
            },
        };
        if let Some(id) = container_id {
            if let Err(e) = self.db.delete(&id).await {
                warn!("Registry delete failed for {}: {}", name, e);
            }
        }

        if remove_volume {
            let user_dir = self.config.system.data_directory.join(user_id);
            if let Err(e) = tokio::fs::remove_dir_all(&user_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove data directory {:?}: {}", user_dir, e);
                }
            }
        }

        Ok(())
    }

    /// All containers currently cached as running
    pub fn list_all(&self) -> Vec<ContainerInfo> {
        self.containers.iter().map(|r| r.value().clone()).collect()
    }

    /// The cached container for a user, if any
    pub fn get_by_user(&self, user_id: &str) -> Option<ContainerInfo> {
        self.containers.get(user_id).map(|r| r.value().clone())
    }

    /// Refresh the activity clock for a user's container
    pub fn touch(&self, user_id: &str) {
        let container_id = match self.containers.get_mut(user_id) {
            Some(mut entry) => {
                entry.last_active = Utc::now();
                entry.container_id.clone()
            }
            None => return,
        };

        // Registry write is best-effort and off the hot path
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.touch_last_active(&container_id).await {
                warn!("Registry touch failed for {}: {}", container_id, e);
            }
        });
    }

    /// Poll inspect every 500 ms until the container reports running (and
    /// healthy, when a healthcheck is declared) or the deadline passes.
    pub(crate) async fn wait_for_ready(&self, name: &str) -> Result<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.timeouts.readiness_secs);

        loop {
            match self.docker.inspect_container(name, None).await {
                Ok(details) => {
                    if container_ready(&details) {
                        return Ok(());
                    }
                }
                Err(e) => debug!("Readiness inspect of {} failed: {}", name, e),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(BackplaneError::ContainerStartupTimeout(
                    self.config.timeouts.readiness_secs,
                ));
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Boot reconciliation: align registry records with the live runtime.
    /// Best-effort; each record is bounded by a short inspect timeout.
    pub async fn reconcile(&self) {
        let records = match self.db.list_active().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Reconciliation skipped, registry unreadable: {}", e);
                return;
            }
        };

        info!("Reconciling {} registry records", records.len());

        for record in records {
            let inspect = tokio::time::timeout(
                Duration::from_secs(2),
                self.docker.inspect_container(&record.container_name, None),
            )
            .await;

            match inspect {
                Ok(Ok(details)) => {
                    let running = details
                        .state
                        .as_ref()
                        .and_then(|s| s.running)
                        .unwrap_or(false);

                    if running {
                        match self.info_from_inspect(&record.user_id, &details) {
                            Ok(info) => {
                                self.containers.insert(record.user_id.clone(), info);
                            }
                            Err(e) => {
                                warn!("Skipping {}: {}", record.container_name, e);
                                continue;
                            }
                        }
                        if let Err(e) = self.db.touch_last_active(&record.container_id).await {
                            warn!("Registry touch failed during reconcile: {}", e);
                        }
                        if let Err(e) = self
                            .db
                            .mark_status(&record.container_id, ContainerStatus::Running)
                            .await
                        {
                            warn!("Registry write failed during reconcile: {}", e);
                        }
                    } else {
                        if let Err(e) = self
                            .db
                            .mark_status(&record.container_id, ContainerStatus::Stopped)
                            .await
                        {
                            warn!("Registry write failed during reconcile: {}", e);
                        }
                    }
                }
                Ok(Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    ..
                })) => {
                    debug!(
                        "Purging registry record for missing container {}",
                        record.container_name
                    );
                    if let Err(e) = self.db.delete(&record.container_id).await {
                        warn!("Registry delete failed during reconcile: {}", e);
                    }
                }
                Ok(Err(e)) => {
                    warn!("Inspect of {} failed: {}", record.container_name, e);
                }
                Err(_) => {
                    warn!("Inspect of {} timed out", record.container_name);
                }
            }
        }

        info!("Reconciliation complete, {} live", self.containers.len());
    }

    /// Timer loop destroying containers idle beyond the configured threshold
    pub fn spawn_reaper(self: &Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                manager.config.timeouts.reaper_interval_secs,
            ));
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Idle reaper stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        manager.reap_idle().await;
                    }
                }
            }
        })
    }

    async fn reap_idle(&self) {
        let idle_after =
            chrono::Duration::seconds(self.config.timeouts.container_idle_secs as i64);
        let now = Utc::now();

        let idle_users: Vec<String> = self
            .containers
            .iter()
            .filter(|entry| now - entry.last_active > idle_after)
            .map(|entry| entry.key().clone())
            .collect();

        for user_id in idle_users {
            info!("Reaping idle container for user {}", user_id);
            // Host data directory stays; only explicit destroy removes it
            if let Err(e) = self.destroy_container(&user_id, false).await {
                warn!("Reaper failed to destroy container for {}: {}", user_id, e);
            }
        }
    }

    pub(crate) async fn persist_running(&self, info: &ContainerInfo) {
        let mut record = ContainerRecord::new(
            info.user_id.clone(),
            info.container_id.clone(),
            info.container_name.clone(),
        );
        record.created_at = info.created_at;
        record.last_active = info.last_active;

        if let Err(e) = self.db.upsert(&record).await {
            warn!(
                "Registry write failed for {}: {}",
                info.container_name, e
            );
        }
    }

    pub(crate) fn cache_insert(&self, info: ContainerInfo) {
        self.containers.insert(info.user_id.clone(), info);
    }

    pub(crate) fn registry(&self) -> &Database {
        &self.db
    }

    /// Build a ContainerInfo from inspect output, reading the tier back from
    /// the labels the container was created with.
    fn info_from_inspect(
        &self,
        user_id: &str,
        details: &ContainerInspectResponse,
    ) -> Result<ContainerInfo> {
        let container_id = details
            .id
            .clone()
            .ok_or_else(|| BackplaneError::Internal("inspect response missing id".into()))?;

        let labels = details
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();

        let tier = labels
            .get("tier")
            .and_then(|t| ResourceTier::parse(t))
            .unwrap_or_default();

        let created_at = details
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(ContainerInfo {
            container_id,
            container_name: Self::container_name(user_id),
            user_id: user_id.to_string(),
            tier,
            created_at,
            last_active: Utc::now(),
        })
    }
}

fn container_ready(details: &ContainerInspectResponse) -> bool {
    let state = match &details.state {
        Some(state) => state,
        None => return false,
    };

    if !state.running.unwrap_or(false) {
        return false;
    }

    // Healthcheck is optional; when declared, require healthy
    match state.health.as_ref().and_then(|h| h.status) {
        None | Some(bollard::models::HealthStatusEnum::NONE) => true,
        Some(bollard::models::HealthStatusEnum::HEALTHY) => true,
        _ => false,
    }
}
