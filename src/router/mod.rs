//! WebSocket and REST routing
//!
//! One WebSocket endpoint multiplexes the chat and shell channels; a thin
//! REST surface exposes file and container operations over the same
//! components.

mod messages;
mod rest;
mod websocket;
mod writer;

pub use messages::{Attachment, Incoming, Outgoing, ShellInit};
pub use writer::{Writer, WriterRegistry};

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::agent::{AgentBroker, Provider};
use crate::config::Configuration;
use crate::container::ContainerManager;
use crate::pty::PtyBroker;
use crate::workspace::FileGateway;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub manager: Arc<ContainerManager>,
    pub claude: Arc<AgentBroker>,
    pub cursor: Arc<AgentBroker>,
    pub codex: Arc<AgentBroker>,
    pub pty: Arc<PtyBroker>,
    pub files: Arc<FileGateway>,
    pub writers: Arc<WriterRegistry>,
}

impl AppState {
    /// The broker registered for a provider
    pub fn broker(&self, provider: Provider) -> &Arc<AgentBroker> {
        match provider {
            Provider::Claude => &self.claude,
            Provider::Cursor => &self.cursor,
            Provider::Codex => &self.codex,
        }
    }

    /// Publish a taskmaster event to every connected client
    pub fn broadcast_taskmaster(&self, event: &str, payload: serde_json::Value) {
        self.writers.broadcast(&Outgoing::TaskmasterEvent {
            event: event.to_string(),
            payload,
        });
    }
}

/// Build the router with all routes
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/system", get(rest::system_info))
        .route("/containers", get(rest::list_containers))
        .route("/containers/:user_id/stats", get(rest::container_stats))
        .route("/containers/:user_id/stop", post(rest::stop_container))
        .route("/containers/:user_id/start", post(rest::start_container))
        .route("/containers/:user_id", delete(rest::destroy_container))
        .route("/files/:user_id/list", get(rest::list_files))
        .route("/files/:user_id/contents", get(rest::read_file))
        .route("/files/:user_id/stat", get(rest::stat_file))
        .route("/files/:user_id/write", post(rest::write_file))
        .route("/files/:user_id", delete(rest::delete_file))
        .route("/projects/:user_id", get(rest::get_projects));

    Router::new()
        .route("/ws", get(websocket::ws_handler))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
