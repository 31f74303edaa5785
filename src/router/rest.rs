//! REST surface for file and container operations
//!
//! Thin handlers over the same gateway/manager code the WebSocket channel
//! uses. User identity arrives from the auth layer in front of us.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::ResourceTier;
use crate::container::UserConfig;
use crate::error::Result;
use crate::workspace::ProjectScope;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub container_project: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub tier: Option<String>,
}

impl FileQuery {
    fn scope(&self) -> ProjectScope {
        ProjectScope {
            project_path: self.project.clone(),
            is_container_project: self.container_project,
        }
    }

    fn user_config(&self) -> UserConfig {
        UserConfig {
            tier: self
                .tier
                .as_deref()
                .and_then(ResourceTier::parse)
                .unwrap_or_default(),
        }
    }
}

pub async fn system_info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": "agent-backplane",
        "version": env!("CARGO_PKG_VERSION"),
        "containers": state.manager.list_all().len(),
        "clients": state.writers.len(),
    }))
}

pub async fn list_containers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "containers": state.manager.list_all() }))
}

pub async fn container_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>> {
    let stats = state.manager.get_container_stats(&user_id).await?;
    Ok(Json(json!(stats)))
}

pub async fn stop_container(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>> {
    state.manager.stop_container(&user_id, 10).await?;
    Ok(Json(json!({ "stopped": true })))
}

pub async fn start_container(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>> {
    let info = state.manager.start_container(&user_id).await?;
    Ok(Json(json!({ "container": info })))
}

#[derive(Debug, Deserialize)]
pub struct DestroyQuery {
    #[serde(default)]
    pub remove_volume: bool,
}

pub async fn destroy_container(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<DestroyQuery>,
) -> Result<Json<Value>> {
    state
        .manager
        .destroy_container(&user_id, query.remove_volume)
        .await?;
    Ok(Json(json!({ "destroyed": true })))
}

pub async fn list_files(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Json<Value>> {
    let entries = state
        .files
        .list(
            &user_id,
            &query.user_config(),
            &query.scope(),
            &query.path,
            query.hidden,
        )
        .await?;
    Ok(Json(json!({ "entries": entries })))
}

pub async fn read_file(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Json<Value>> {
    let content = state
        .files
        .read(&user_id, &query.user_config(), &query.scope(), &query.path)
        .await?;
    Ok(Json(json!({ "content": content })))
}

pub async fn stat_file(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Json<Value>> {
    let info = state
        .files
        .stat(&user_id, &query.user_config(), &query.scope(), &query.path)
        .await?;
    Ok(Json(json!(info)))
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub container_project: bool,
    #[serde(default)]
    pub tier: Option<String>,
}

pub async fn write_file(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<WriteRequest>,
) -> Result<Json<Value>> {
    let scope = ProjectScope {
        project_path: request.project.clone(),
        is_container_project: request.container_project,
    };
    let user_config = UserConfig {
        tier: request
            .tier
            .as_deref()
            .and_then(ResourceTier::parse)
            .unwrap_or_default(),
    };

    state
        .files
        .write(
            &user_id,
            &user_config,
            &scope,
            &request.path,
            request.content.as_bytes(),
        )
        .await?;
    Ok(Json(json!({ "written": true })))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Json<Value>> {
    state
        .files
        .delete(&user_id, &query.user_config(), &query.scope(), &query.path)
        .await?;
    Ok(Json(json!({ "deleted": true })))
}

pub async fn get_projects(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Json<Value>> {
    let projects = state
        .files
        .get_projects(&user_id, &query.user_config())
        .await?;
    Ok(Json(json!({ "projects": projects })))
}
